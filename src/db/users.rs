//! User repository: identities, role grants and validation codes.

use super::models::{UserRole, UserRow, ValidationRequestRow};
use super::{DbError, now_ts};
use crate::codes::generate_code;
use crate::error::OperationError;
use relay_sdk::PeerInfo;
use sqlx::SqlitePool;

const DAY_SECS: i64 = 86_400;

/// Repository for user operations.
pub struct UserRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UserRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the user for a platform peer, creating or refreshing the row.
    pub async fn get_or_create(&self, peer: &PeerInfo) -> Result<UserRow, DbError> {
        if let Some(existing) = self.by_uid(peer.id).await? {
            if existing.username != peer.username
                || existing.first_name != peer.first_name
                || existing.last_name != peer.last_name
            {
                sqlx::query(
                    "UPDATE users SET username = ?, first_name = ?, last_name = ? WHERE id = ?",
                )
                .bind(&peer.username)
                .bind(&peer.first_name)
                .bind(&peer.last_name)
                .bind(existing.id)
                .execute(self.pool)
                .await?;
            }
            return Ok(UserRow {
                username: peer.username.clone(),
                first_name: peer.first_name.clone(),
                last_name: peer.last_name.clone(),
                ..existing
            });
        }

        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO users (uid, username, first_name, last_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(peer.id)
        .bind(&peer.username)
        .bind(&peer.first_name)
        .bind(&peer.last_name)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(UserRow {
            id: result.last_insert_rowid(),
            uid: peer.id,
            username: peer.username.clone(),
            first_name: peer.first_name.clone(),
            last_name: peer.last_name.clone(),
            created_at: now,
        })
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<UserRow>, DbError> {
        Ok(sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn by_uid(&self, uid: i64) -> Result<Option<UserRow>, DbError> {
        Ok(sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(self.pool)
            .await?)
    }

    /// True iff the user holds any of `roles` with a non-expired grant.
    pub async fn validate(&self, user_id: i64, roles: &[UserRole]) -> Result<bool, DbError> {
        if roles.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; roles.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM validations \
             WHERE user_id = ? AND role IN ({placeholders}) \
             AND (until IS NULL OR until > ?)"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(user_id);
        for role in roles {
            query = query.bind(*role as i32);
        }
        let count = query.bind(now_ts()).fetch_one(self.pool).await?;
        Ok(count > 0)
    }

    /// Guard form of [`Self::validate`]; `reversed` negates the predicate.
    pub async fn require(
        &self,
        user_id: i64,
        roles: &[UserRole],
        reversed: bool,
    ) -> Result<(), OperationError> {
        let held = self.validate(user_id, roles).await?;
        let ok = if reversed { !held } else { held };
        if ok {
            Ok(())
        } else {
            Err(OperationError::UserRole {
                roles: roles.to_vec(),
                reversed,
            })
        }
    }

    /// Whether the user carries PRIME privileges.
    pub async fn is_prime(&self, user_id: i64) -> Result<bool, DbError> {
        self.validate(user_id, UserRole::prime()).await
    }

    /// All distinct live roles of a user, ascending.
    pub async fn roles_of(&self, user_id: i64) -> Result<Vec<UserRole>, DbError> {
        let rows = sqlx::query_as::<_, (i32,)>(
            "SELECT DISTINCT role FROM validations \
             WHERE user_id = ? AND (until IS NULL OR until > ?) ORDER BY role",
        )
        .bind(user_id)
        .bind(now_ts())
        .fetch_all(self.pool)
        .await?;
        Ok(rows.into_iter().map(|(r,)| UserRole::from_i32(r)).collect())
    }

    /// Grant `roles` to the user, extending expiry when already held.
    /// Records a back-linked request per grant so origin stays answerable.
    pub async fn add_role(
        &self,
        user_id: i64,
        roles: &[UserRole],
        days: Option<i64>,
    ) -> Result<(), DbError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        for role in roles {
            let request = sqlx::query(
                r#"
                INSERT INTO validation_requests (code, role, days, created_by, created_at)
                VALUES (NULL, ?, ?, ?, ?)
                "#,
            )
            .bind(*role as i32)
            .bind(days)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            let validation_id = grant_on(&mut tx, user_id, *role, days, now).await?;
            sqlx::query("UPDATE validation_requests SET used_validation = ? WHERE id = ?")
                .bind(validation_id)
                .bind(request.last_insert_rowid())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Expire all live grants of the given roles. Returns how many.
    pub async fn remove_role(&self, user_id: i64, roles: &[UserRole]) -> Result<u64, DbError> {
        if roles.is_empty() {
            return Ok(0);
        }
        let now = now_ts();
        let placeholders = vec!["?"; roles.len()].join(", ");
        let sql = format!(
            "UPDATE validations SET until = ? \
             WHERE user_id = ? AND role IN ({placeholders}) \
             AND (until IS NULL OR until > ?)"
        );
        let mut query = sqlx::query(&sql).bind(now).bind(user_id);
        for role in roles {
            query = query.bind(*role as i32);
        }
        let result = query.bind(now).execute(self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Generate `num` redeemable codes, each carrying every role in `roles`.
    pub async fn create_code(
        &self,
        user_id: i64,
        roles: &[UserRole],
        days: Option<i64>,
        length: usize,
        num: usize,
    ) -> Result<Vec<String>, DbError> {
        let now = now_ts();
        let mut codes = Vec::with_capacity(num);
        let mut tx = self.pool.begin().await?;
        for _ in 0..num {
            let code = generate_code(length);
            for role in roles {
                sqlx::query(
                    r#"
                    INSERT INTO validation_requests (code, role, days, created_by, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&code)
                .bind(*role as i32)
                .bind(days)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            codes.push(code);
        }
        tx.commit().await?;
        Ok(codes)
    }

    /// Atomically consume every unused request matching `code`, granting the
    /// carried roles. A consumed request cannot be consumed again, so a
    /// second redemption returns the empty list.
    pub async fn use_code(
        &self,
        user_id: i64,
        code: &str,
    ) -> Result<Vec<(UserRole, Option<i64>)>, DbError> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        let requests = sqlx::query_as::<_, ValidationRequestRow>(
            "SELECT * FROM validation_requests WHERE code = ? AND used_validation IS NULL",
        )
        .bind(code)
        .fetch_all(&mut *tx)
        .await?;

        let mut used = Vec::with_capacity(requests.len());
        for request in requests {
            let validation_id = grant_on(&mut tx, user_id, request.role, request.days, now).await?;
            sqlx::query("UPDATE validation_requests SET used_validation = ? WHERE id = ?")
                .bind(validation_id)
                .bind(request.id)
                .execute(&mut *tx)
                .await?;
            used.push((request.role, request.days));
        }
        tx.commit().await?;
        Ok(used)
    }

    /// The user who issued the INVITED code this user consumed, if any.
    pub async fn inviter_of(&self, user_id: i64) -> Result<Option<UserRow>, DbError> {
        Ok(sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.* FROM validation_requests vr
            JOIN validations v ON vr.used_validation = v.id
            JOIN users u ON vr.created_by = u.id
            WHERE v.user_id = ? AND vr.role = ?
            ORDER BY vr.created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(UserRole::Invited as i32)
        .fetch_optional(self.pool)
        .await?)
    }
}

/// Grant one role inside an open transaction, extending an existing live
/// grant instead of stacking a second one. Returns the validation id.
async fn grant_on(
    tx: &mut sqlx::SqliteConnection,
    user_id: i64,
    role: UserRole,
    days: Option<i64>,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let existing = sqlx::query_as::<_, (i64, Option<i64>)>(
        "SELECT id, until FROM validations \
         WHERE user_id = ? AND role = ? AND (until IS NULL OR until > ?) LIMIT 1",
    )
    .bind(user_id)
    .bind(role as i32)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    match existing {
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
            Ok(id)
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
            Ok(result.last_insert_rowid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn peer(id: i64, name: &str) -> PeerInfo {
        PeerInfo {
            id,
            username: None,
            first_name: Some(name.to_string()),
            last_name: None,
        }
    }

    #[tokio::test]
    async fn double_grant_extends_expiry() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let user = users.get_or_create(&peer(1, "a")).await.unwrap();

        users
            .add_role(user.id, &[UserRole::Awarded], Some(10))
            .await
            .unwrap();
        users
            .add_role(user.id, &[UserRole::Awarded], Some(10))
            .await
            .unwrap();

        let (count, until) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT COUNT(*), MAX(until) FROM validations WHERE user_id = ? AND role = ?",
        )
        .bind(user.id)
        .bind(UserRole::Awarded as i32)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count, 1, "a single grant row must absorb both additions");
        let until = until.unwrap();
        let expected = now_ts() + 20 * DAY_SECS;
        assert!((until - expected).abs() < 5);
    }

    #[tokio::test]
    async fn use_code_is_idempotent() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let issuer = users.get_or_create(&peer(1, "issuer")).await.unwrap();
        let redeemer = users.get_or_create(&peer(2, "redeemer")).await.unwrap();

        let codes = users
            .create_code(issuer.id, &[UserRole::Awarded], Some(30), 16, 1)
            .await
            .unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].len(), 16);

        let used = users.use_code(redeemer.id, &codes[0]).await.unwrap();
        assert_eq!(used.len(), 1);
        assert!(users.validate(redeemer.id, &[UserRole::Awarded]).await.unwrap());

        let again = users.use_code(redeemer.id, &codes[0]).await.unwrap();
        assert!(again.is_empty(), "a consumed request cannot be consumed again");
    }

    #[tokio::test]
    async fn inviter_resolves_through_consumed_request() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let inviter = users.get_or_create(&peer(1, "inviter")).await.unwrap();
        let invited = users.get_or_create(&peer(2, "invited")).await.unwrap();

        let codes = users
            .create_code(inviter.id, &[UserRole::Invited], None, 8, 1)
            .await
            .unwrap();
        users.use_code(invited.id, &codes[0]).await.unwrap();

        let found = users.inviter_of(invited.id).await.unwrap().unwrap();
        assert_eq!(found.id, inviter.id);
        assert!(users.inviter_of(inviter.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_grants_do_not_validate() {
        let db = Database::new(":memory:").await.unwrap();
        let users = db.users();
        let user = users.get_or_create(&peer(1, "a")).await.unwrap();

        users.add_role(user.id, &[UserRole::Paying], Some(5)).await.unwrap();
        assert!(users.is_prime(user.id).await.unwrap());

        let removed = users.remove_role(user.id, &[UserRole::Paying]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!users.is_prime(user.id).await.unwrap());
    }
}
