//! Member repository and the per-member half of the permission evaluator.

use super::models::{BanType, GroupRow, MemberRole, MemberRow};
use super::{DbError, generate_ban_group, live_ban_entry, now_ts};
use crate::error::OperationError;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Repository for member operations.
pub struct MemberRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MemberRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<MemberRow>, DbError> {
        Ok(sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn find(&self, group_id: i64, user_id: i64) -> Result<Option<MemberRow>, DbError> {
        Ok(sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE group_id = ? AND user_id = ?",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?)
    }

    pub async fn create(
        &self,
        group_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> Result<MemberRow, DbError> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO members (group_id, user_id, role, created_at, last_activity)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(user_id)
        .bind(role as i32)
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;
        self.by_id(result.last_insert_rowid())
            .await?
            .ok_or(DbError::NotFound("member"))
    }

    /// Members eligible to appear in a fan-out enumeration (role >= GUEST).
    pub async fn recipients(&self, group_id: i64) -> Result<Vec<MemberRow>, DbError> {
        Ok(sqlx::query_as::<_, MemberRow>(
            "SELECT * FROM members WHERE group_id = ? AND role >= ? ORDER BY id",
        )
        .bind(group_id)
        .bind(MemberRole::Guest as i32)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn set_role(&self, member_id: i64, role: MemberRole) -> Result<(), DbError> {
        sqlx::query("UPDATE members SET role = ? WHERE id = ?")
            .bind(role as i32)
            .bind(member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Set `last_activity` to now.
    pub async fn touch(&self, member_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE members SET last_activity = ? WHERE id = ?")
            .bind(now_ts())
            .bind(member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_last_mask(&self, member_id: i64, mask: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE members SET last_mask = ? WHERE id = ?")
            .bind(mask)
            .bind(member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_pinned_mask(
        &self,
        member_id: i64,
        mask: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE members SET pinned_mask = ? WHERE id = ?")
            .bind(mask)
            .bind(member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_invitor(&self, member_id: i64, invitor_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE members SET invitor_id = ? WHERE id = ?")
            .bind(invitor_id)
            .bind(member_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Replace (or install) the member's ban-group override atomically.
    pub async fn replace_ban_group(
        &self,
        member: &MemberRow,
        types: &[BanType],
        until: Option<i64>,
    ) -> Result<(), DbError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        let new_id = generate_ban_group(&mut tx, types, until, now).await?;
        sqlx::query("UPDATE members SET ban_group_id = ? WHERE id = ?")
            .bind(new_id)
            .bind(member.id)
            .execute(&mut *tx)
            .await?;
        if let Some(old) = member.ban_group_id {
            sqlx::query("DELETE FROM ban_groups WHERE id = ?")
                .bind(old)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop the member's ban-group override.
    pub async fn clear_ban_group(&self, member: &MemberRow) -> Result<(), DbError> {
        if let Some(old) = member.ban_group_id {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE members SET ban_group_id = NULL WHERE id = ?")
                .bind(member.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM ban_groups WHERE id = ?")
                .bind(old)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Ban types in the member's override ban group.
    pub async fn member_bans(&self, member: &MemberRow) -> Result<Vec<BanType>, DbError> {
        let Some(ban_group_id) = member.ban_group_id else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, (BanType,)>(
            "SELECT ban_type FROM ban_group_entries WHERE ban_group_id = ? ORDER BY ban_type",
        )
        .bind(ban_group_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Guard form: fail with the violated constraint when `ban` is denied.
    ///
    /// ADMINs bypass all bans. The member override is consulted before the
    /// group default; the first denial wins and the other scope is not
    /// consulted. `check_group = false` restricts the check to the member
    /// override.
    pub async fn check_ban(
        &self,
        member: &MemberRow,
        group: &GroupRow,
        ban: BanType,
        check_group: bool,
    ) -> Result<(), OperationError> {
        match self.denied_scope(member, group, ban, check_group).await? {
            Some((member_scope, until)) => Err(OperationError::Ban {
                ban,
                member_scope,
                until: until.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            }),
            None => Ok(()),
        }
    }

    /// Predicate form of [`Self::check_ban`].
    pub async fn check_ban_quiet(
        &self,
        member: &MemberRow,
        group: &GroupRow,
        ban: BanType,
        check_group: bool,
    ) -> Result<bool, DbError> {
        Ok(self
            .denied_scope(member, group, ban, check_group)
            .await?
            .is_some())
    }

    async fn denied_scope(
        &self,
        member: &MemberRow,
        group: &GroupRow,
        ban: BanType,
        check_group: bool,
    ) -> Result<Option<(bool, Option<i64>)>, DbError> {
        if member.role >= MemberRole::Admin {
            return Ok(None);
        }
        let now = now_ts();
        if let Some(ban_group_id) = member.ban_group_id
            && let Some(until) = live_ban_entry(self.pool, ban_group_id, ban, now).await?
        {
            return Ok(Some((true, until)));
        }
        if check_group
            && let Some(until) =
                live_ban_entry(self.pool, group.default_ban_group_id, ban, now).await?
        {
            return Ok(Some((false, until)));
        }
        Ok(None)
    }

    pub async fn n_messages(&self, member_id: i64) -> Result<i64, DbError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE member_id = ?")
                .bind(member_id)
                .fetch_one(self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use relay_sdk::{BotProfile, PeerInfo};

    async fn setup() -> (Database, GroupRow, MemberRow) {
        let db = Database::new(":memory:").await.unwrap();
        let creator = db
            .users()
            .get_or_create(&PeerInfo {
                id: 1,
                username: None,
                first_name: Some("C".into()),
                last_name: None,
            })
            .await
            .unwrap();
        let group = db
            .groups()
            .create_with_creator(
                "tok:m",
                &BotProfile {
                    id: 42,
                    username: "g".into(),
                    name: "G".into(),
                },
                &creator,
                180,
            )
            .await
            .unwrap();
        let user = db
            .users()
            .get_or_create(&PeerInfo {
                id: 2,
                username: None,
                first_name: Some("M".into()),
                last_name: None,
            })
            .await
            .unwrap();
        let member = db
            .members()
            .create(group.id, user.id, MemberRole::Member)
            .await
            .unwrap();
        (db, group, member)
    }

    #[tokio::test]
    async fn member_override_wins_over_group_default() {
        let (db, group, member) = setup().await;

        db.groups()
            .replace_default_ban_group(&group, &[BanType::Message], None)
            .await
            .unwrap();
        let group = db.groups().by_id(group.id).await.unwrap().unwrap();
        db.members()
            .replace_ban_group(&member, &[BanType::Message], None)
            .await
            .unwrap();
        let member = db.members().by_id(member.id).await.unwrap().unwrap();

        let err = db
            .members()
            .check_ban(&member, &group, BanType::Message, true)
            .await
            .unwrap_err();
        match err {
            OperationError::Ban { member_scope, .. } => assert!(member_scope),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn admins_bypass_bans() {
        let (db, group, member) = setup().await;
        db.groups()
            .replace_default_ban_group(&group, &[BanType::Message], None)
            .await
            .unwrap();
        let group = db.groups().by_id(group.id).await.unwrap().unwrap();

        db.members().set_role(member.id, MemberRole::Admin).await.unwrap();
        let member = db.members().by_id(member.id).await.unwrap().unwrap();
        assert!(
            db.members()
                .check_ban(&member, &group, BanType::Message, true)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn expired_ban_groups_stop_denying() {
        let (db, group, member) = setup().await;
        db.members()
            .replace_ban_group(&member, &[BanType::Message], Some(now_ts() - 60))
            .await
            .unwrap();
        let member = db.members().by_id(member.id).await.unwrap().unwrap();
        assert!(
            !db.members()
                .check_ban_quiet(&member, &group, BanType::Message, false)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn member_scope_only_check_ignores_group_default() {
        let (db, group, member) = setup().await;
        db.groups()
            .replace_default_ban_group(&group, &[BanType::Receive], None)
            .await
            .unwrap();
        let group = db.groups().by_id(group.id).await.unwrap().unwrap();

        assert!(
            !db.members()
                .check_ban_quiet(&member, &group, BanType::Receive, false)
                .await
                .unwrap()
        );
        assert!(
            db.members()
                .check_ban_quiet(&member, &group, BanType::Receive, true)
                .await
                .unwrap()
        );
    }
}
