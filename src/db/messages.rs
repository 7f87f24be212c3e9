//! Message repository: broadcast records, the redirect index and the PM
//! tunnel.
//!
//! The redirect index is what makes edits, deletions, pins and replies O(1)
//! per recipient: `(source message, recipient) -> recipient-side mid`, plus
//! the reverse lookups used when a member replies to a forwarded copy.

use super::models::{MessageRow, PmMessageRow, RedirectRow};
use super::{DbError, now_ts};
use sqlx::SqlitePool;

/// Repository for message operations.
pub struct MessageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MessageRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        group_id: i64,
        mid: i64,
        member_id: i64,
        mask: &str,
        reply_to_id: Option<i64>,
    ) -> Result<MessageRow, DbError> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO messages (group_id, mid, member_id, mask, reply_to_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(mid)
        .bind(member_id)
        .bind(mask)
        .bind(reply_to_id)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;
        self.by_id(result.last_insert_rowid())
            .await?
            .ok_or(DbError::NotFound("message"))
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<MessageRow>, DbError> {
        Ok(sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    /// The sender-side message record for (mid, author member).
    pub async fn find_by_mid_member(
        &self,
        mid: i64,
        member_id: i64,
    ) -> Result<Option<MessageRow>, DbError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE mid = ? AND member_id = ?",
        )
        .bind(mid)
        .bind(member_id)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Record a recipient-side copy. Duplicate (recipient, mid) insertion is
    /// a bug upstream and fails loudly.
    pub async fn record_redirect(
        &self,
        message_id: i64,
        to_member_id: i64,
        mid: i64,
    ) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO redirects (message_id, to_member_id, mid, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(message_id)
        .bind(to_member_id)
        .bind(mid)
        .bind(now_ts())
        .execute(self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(DbError::Conflict(
                format!("duplicate redirect for member {to_member_id} mid {mid}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// The recipient-side copy of `message_id` for a member, if delivered.
    pub async fn redirect_for(
        &self,
        message_id: i64,
        to_member_id: i64,
    ) -> Result<Option<RedirectRow>, DbError> {
        Ok(sqlx::query_as::<_, RedirectRow>(
            "SELECT * FROM redirects WHERE message_id = ? AND to_member_id = ?",
        )
        .bind(message_id)
        .bind(to_member_id)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Reverse lookup: which source message produced the copy `mid` in this
    /// member's chat.
    pub async fn reverse(&self, mid: i64, to_member_id: i64) -> Result<Option<MessageRow>, DbError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT m.* FROM messages m
            JOIN redirects r ON r.message_id = m.id
            WHERE r.mid = ? AND r.to_member_id = ?
            "#,
        )
        .bind(mid)
        .bind(to_member_id)
        .fetch_optional(self.pool)
        .await?)
    }

    /// Reverse lookup into the PM tunnel.
    pub async fn pm_reverse(
        &self,
        redirected_mid: i64,
        to_member_id: i64,
    ) -> Result<Option<PmMessageRow>, DbError> {
        Ok(sqlx::query_as::<_, PmMessageRow>(
            "SELECT * FROM pm_messages WHERE redirected_mid = ? AND to_member_id = ?",
        )
        .bind(redirected_mid)
        .bind(to_member_id)
        .fetch_optional(self.pool)
        .await?)
    }

    pub async fn set_pinned(&self, message_id: i64, pinned: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE messages SET pinned = ?, updated_at = ? WHERE id = ?")
            .bind(pinned)
            .bind(now_ts())
            .bind(message_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_updated(&self, message_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE messages SET updated_at = ? WHERE id = ?")
            .bind(now_ts())
            .bind(message_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// The most recent `limit` messages of a group, oldest first.
    pub async fn recent(&self, group_id: i64, limit: i64) -> Result<Vec<MessageRow>, DbError> {
        let mut rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE group_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(group_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Currently pinned messages, oldest first.
    pub async fn pinned(&self, group_id: i64) -> Result<Vec<MessageRow>, DbError> {
        Ok(sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE group_id = ? AND pinned = 1 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn create_pm(
        &self,
        from_member_id: i64,
        to_member_id: i64,
        mid: i64,
        redirected_mid: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO pm_messages (from_member_id, to_member_id, mid, redirected_mid, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(from_member_id)
        .bind(to_member_id)
        .bind(mid)
        .bind(redirected_mid)
        .bind(now_ts())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Whether `to` has suppressed PMs from `from`.
    pub async fn pm_ban_exists(&self, from_member_id: i64, to_member_id: i64) -> Result<bool, DbError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM pm_bans WHERE from_member_id = ? AND to_member_id = ?",
        )
        .bind(from_member_id)
        .bind(to_member_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn create_pm_ban(&self, from_member_id: i64, to_member_id: i64) -> Result<(), DbError> {
        sqlx::query(
            "INSERT OR IGNORE INTO pm_bans (from_member_id, to_member_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(from_member_id)
        .bind(to_member_id)
        .bind(now_ts())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_pm_ban(&self, from_member_id: i64, to_member_id: i64) -> Result<(), DbError> {
        sqlx::query("DELETE FROM pm_bans WHERE from_member_id = ? AND to_member_id = ?")
            .bind(from_member_id)
            .bind(to_member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}
