//! Group repository: hosted relays and their default ban groups.

use super::models::{BanType, GroupRow, MemberRole, UserRole, UserRow};
use super::{DbError, generate_ban_group, live_ban_entry, now_ts};
use crate::error::OperationError;
use chrono::{DateTime, Utc};
use relay_sdk::BotProfile;
use sqlx::SqlitePool;

/// Repository for group operations.
pub struct GroupRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> GroupRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<GroupRow>, DbError> {
        Ok(sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn by_token(&self, token: &str) -> Result<Option<GroupRow>, DbError> {
        Ok(sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE token = ?")
            .bind(token)
            .fetch_optional(self.pool)
            .await?)
    }

    /// All groups that should be running.
    pub async fn all_enabled(&self) -> Result<Vec<GroupRow>, DbError> {
        Ok(
            sqlx::query_as::<_, GroupRow>("SELECT * FROM groups WHERE disabled = 0 ORDER BY id")
                .fetch_all(self.pool)
                .await?,
        )
    }

    /// Groups created by a user, enabled ones first.
    pub async fn by_creator(&self, user_id: i64) -> Result<Vec<GroupRow>, DbError> {
        Ok(sqlx::query_as::<_, GroupRow>(
            "SELECT * FROM groups WHERE creator_id = ? ORDER BY disabled, id",
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await?)
    }

    /// Create the group, its creator member and an empty default ban group
    /// in one atomic scope, granting the creator GROUPER (and AWARDED to
    /// creator and inviter when the creator was INVITED).
    pub async fn create_with_creator(
        &self,
        token: &str,
        profile: &BotProfile,
        creator: &UserRow,
        invite_award_days: i64,
    ) -> Result<GroupRow, DbError> {
        if self.by_token(token).await?.is_some() {
            return Err(DbError::GroupExists(profile.username.clone()));
        }

        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let ban_group_id = generate_ban_group(&mut tx, &[], None, now).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO groups (
                uid, token, username, title, creator_id, created_at, last_activity,
                default_ban_group_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(profile.id)
        .bind(token)
        .bind(&profile.username)
        .bind(&profile.name)
        .bind(creator.id)
        .bind(now)
        .bind(now)
        .bind(ban_group_id)
        .execute(&mut *tx)
        .await?;
        let group_id = result.last_insert_rowid();

        sqlx::query(
            r#"
            INSERT INTO members (group_id, user_id, role, created_at, last_activity)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(creator.id)
        .bind(MemberRole::Creator as i32)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if !has_live_role(&mut tx, creator.id, UserRole::Grouper, now).await? {
            grant_in_tx(&mut tx, creator.id, UserRole::Grouper, None, now).await?;
        }
        if has_live_role(&mut tx, creator.id, UserRole::Invited, now).await? {
            grant_in_tx(&mut tx, creator.id, UserRole::Awarded, Some(invite_award_days), now)
                .await?;
            let inviter = sqlx::query_as::<_, (i64,)>(
                r#"
                SELECT vr.created_by FROM validation_requests vr
                JOIN validations v ON vr.used_validation = v.id
                WHERE v.user_id = ? AND vr.role = ?
                ORDER BY vr.created_at DESC LIMIT 1
                "#,
            )
            .bind(creator.id)
            .bind(UserRole::Invited as i32)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((inviter_id,)) = inviter {
                grant_in_tx(&mut tx, inviter_id, UserRole::Awarded, Some(invite_award_days), now)
                    .await?;
            }
        }

        tx.commit().await?;

        self.by_id(group_id)
            .await?
            .ok_or(DbError::NotFound("group"))
    }

    /// Set `last_activity` to now.
    pub async fn touch(&self, group_id: i64) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET last_activity = ? WHERE id = ?")
            .bind(now_ts())
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Persist the freshest handle/title reported by the platform.
    pub async fn save_profile(&self, group_id: i64, profile: &BotProfile) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET username = ?, title = ? WHERE id = ?")
            .bind(&profile.username)
            .bind(&profile.name)
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_disabled(&self, group_id: i64, disabled: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_welcome(
        &self,
        group_id: i64,
        message: Option<&str>,
        photo: Option<&str>,
        buttons: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE groups SET welcome_message = ?, welcome_photo = ?, welcome_buttons = ? \
             WHERE id = ?",
        )
        .bind(message)
        .bind(photo)
        .bind(buttons)
        .bind(group_id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_welcome_latest(&self, group_id: i64, enabled: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET welcome_latest = ? WHERE id = ?")
            .bind(enabled)
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_chat_instruction(
        &self,
        group_id: i64,
        instruction: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET chat_instruction = ? WHERE id = ?")
            .bind(instruction)
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_password(&self, group_id: i64, password: Option<&str>) -> Result<(), DbError> {
        sqlx::query("UPDATE groups SET password = ?, private = ? WHERE id = ?")
            .bind(password)
            .bind(password.is_some())
            .bind(group_id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Replace the default ban group atomically: generate the new one,
    /// repoint the group, delete the old one (entries cascade).
    pub async fn replace_default_ban_group(
        &self,
        group: &GroupRow,
        types: &[BanType],
        until: Option<i64>,
    ) -> Result<(), DbError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        let new_id = generate_ban_group(&mut tx, types, until, now).await?;
        sqlx::query("UPDATE groups SET default_ban_group_id = ? WHERE id = ?")
            .bind(new_id)
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ban_groups WHERE id = ?")
            .bind(group.default_ban_group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Ban types in the group's default ban group.
    pub async fn default_bans(&self, group: &GroupRow) -> Result<Vec<BanType>, DbError> {
        let rows = sqlx::query_as::<_, (BanType,)>(
            "SELECT ban_type FROM ban_group_entries WHERE ban_group_id = ? ORDER BY ban_type",
        )
        .bind(group.default_ban_group_id)
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Predicate form: does the group default deny `ban` right now?
    pub async fn cannot(&self, group: &GroupRow, ban: BanType) -> Result<bool, DbError> {
        Ok(
            live_ban_entry(self.pool, group.default_ban_group_id, ban, now_ts())
                .await?
                .is_some(),
        )
    }

    /// Guard form of [`Self::cannot`].
    pub async fn check_ban(&self, group: &GroupRow, ban: BanType) -> Result<(), OperationError> {
        let entry = live_ban_entry(self.pool, group.default_ban_group_id, ban, now_ts())
            .await
            .map_err(DbError::from)?;
        match entry {
            Some(until) => Err(OperationError::Ban {
                ban,
                member_scope: false,
                until: until.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            }),
            None => Ok(()),
        }
    }

    /// Members with role >= GUEST.
    pub async fn n_members(&self, group_id: i64) -> Result<i64, DbError> {
        Ok(sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM members WHERE group_id = ? AND role >= ?",
        )
        .bind(group_id)
        .bind(MemberRole::Guest as i32)
        .fetch_one(self.pool)
        .await?)
    }

    pub async fn n_messages(&self, group_id: i64) -> Result<i64, DbError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(self.pool)
                .await?,
        )
    }
}

async fn has_live_role(
    tx: &mut sqlx::SqliteConnection,
    user_id: i64,
    role: UserRole,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM validations \
         WHERE user_id = ? AND role = ? AND (until IS NULL OR until > ?)",
    )
    .bind(user_id)
    .bind(role as i32)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    Ok(count > 0)
}

/// Grant a role inside the group-creation transaction, recording the
/// originating request like every other grant.
async fn grant_in_tx(
    tx: &mut sqlx::SqliteConnection,
    user_id: i64,
    role: UserRole,
    days: Option<i64>,
    now: i64,
) -> Result<(), sqlx::Error> {
    const DAY_SECS: i64 = 86_400;
    let request = sqlx::query(
        "INSERT INTO validation_requests (code, role, days, created_by, created_at) \
         VALUES (NULL, ?, ?, ?, ?)",
    )
    .bind(role as i32)
    .bind(days)
    .bind(user_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let existing = sqlx::query_as::<_, (i64, Option<i64>)>(
        "SELECT id, until FROM validations \
         WHERE user_id = ? AND role = ? AND (until IS NULL OR until > ?) LIMIT 1",
    )
    .bind(user_id)
    .bind(role as i32)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let validation_id = match existing {
        Some((id, until)) => {
            let new_until = match (days, until) {
                (None, _) | (_, None) => None,
                (Some(d), Some(u)) => Some(u + d * DAY_SECS),
            };
            sqlx::query("UPDATE validations SET until = ? WHERE id = ?")
                .bind(new_until)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            id
        }
        None => {
            let until = days.map(|d| now + d * DAY_SECS);
            let result = sqlx::query(
                "INSERT INTO validations (user_id, role, until, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(role as i32)
            .bind(until)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            result.last_insert_rowid()
        }
    };

    sqlx::query("UPDATE validation_requests SET used_validation = ? WHERE id = ?")
        .bind(validation_id)
        .bind(request.last_insert_rowid())
        .execute(&mut *tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use relay_sdk::PeerInfo;

    fn profile() -> BotProfile {
        BotProfile {
            id: 7777,
            username: "maskedbot".into(),
            name: "Masked".into(),
        }
    }

    async fn creator(db: &Database) -> UserRow {
        db.users()
            .get_or_create(&PeerInfo {
                id: 1,
                username: None,
                first_name: Some("Creator".into()),
                last_name: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creation_is_atomic_and_grants_grouper() {
        let db = Database::new(":memory:").await.unwrap();
        let user = creator(&db).await;

        let group = db
            .groups()
            .create_with_creator("tok:1", &profile(), &user, 180)
            .await
            .unwrap();
        assert_eq!(group.username, "maskedbot");
        assert!(!group.disabled);

        let member = db.members().find(group.id, user.id).await.unwrap().unwrap();
        assert_eq!(member.role, MemberRole::Creator);
        assert!(db.users().validate(user.id, &[UserRole::Grouper]).await.unwrap());

        // Second create on the same token must refuse.
        let err = db
            .groups()
            .create_with_creator("tok:1", &profile(), &user, 180)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::GroupExists(_)));
    }

    #[tokio::test]
    async fn invited_creator_awards_both_parties() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let inviter = users
            .get_or_create(&PeerInfo {
                id: 5,
                username: None,
                first_name: Some("Y".into()),
                last_name: None,
            })
            .await
            .unwrap();
        let invited = users
            .get_or_create(&PeerInfo {
                id: 6,
                username: None,
                first_name: Some("X".into()),
                last_name: None,
            })
            .await
            .unwrap();
        let codes = users
            .create_code(inviter.id, &[UserRole::Invited], None, 8, 1)
            .await
            .unwrap();
        users.use_code(invited.id, &codes[0]).await.unwrap();

        db.groups()
            .create_with_creator("tok:2", &profile(), &invited, 180)
            .await
            .unwrap();

        assert!(users.validate(invited.id, &[UserRole::Awarded]).await.unwrap());
        assert!(users.validate(inviter.id, &[UserRole::Awarded]).await.unwrap());
    }

    #[tokio::test]
    async fn ban_group_replacement_swaps_entries() {
        let db = Database::new(":memory:").await.unwrap();
        let user = creator(&db).await;
        let group = db
            .groups()
            .create_with_creator("tok:3", &profile(), &user, 180)
            .await
            .unwrap();

        assert!(db.groups().default_bans(&group).await.unwrap().is_empty());
        db.groups()
            .replace_default_ban_group(&group, &[BanType::Sticker, BanType::Link], None)
            .await
            .unwrap();

        let group = db.groups().by_id(group.id).await.unwrap().unwrap();
        let bans = db.groups().default_bans(&group).await.unwrap();
        assert_eq!(bans, vec![BanType::Sticker, BanType::Link]);
        assert!(db.groups().cannot(&group, BanType::Sticker).await.unwrap());
        assert!(!db.groups().cannot(&group, BanType::Message).await.unwrap());

        // The guard form reports the group scope.
        match db.groups().check_ban(&group, BanType::Link).await.unwrap_err() {
            OperationError::Ban { member_scope, .. } => assert!(!member_scope),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(db.groups().check_ban(&group, BanType::Message).await.is_ok());
    }
}
