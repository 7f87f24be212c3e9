//! Database module for persistent storage.
//!
//! Provides async SQLite access using SQLx for:
//! - users, role grants and validation codes
//! - groups, members and ban groups
//! - messages, per-recipient redirects and the PM tunnel

pub mod models;

mod groups;
mod members;
mod messages;
mod users;

pub use groups::GroupRepository;
pub use members::MemberRepository;
pub use messages::MessageRepository;
pub use users::UserRepository;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("group already hosted: {0}")]
    GroupExists(String),
}

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking
    /// indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let pool = if path == ":memory:" {
            // In-memory database. Each open gets a unique shared-cache name
            // so the pool's connections see one database while separate
            // `Database` instances stay isolated.
            static MEMORY_SEQ: std::sync::atomic::AtomicU64 =
                std::sync::atomic::AtomicU64::new(0);
            let seq = MEMORY_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let options = SqliteConnectOptions::new()
                .filename(format!("file:maskrelay-mem-{seq}?mode=memory"))
                .shared_cache(true)
                .foreign_keys(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        info!(path = %path, "Database connected");

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations. Checks for each table and runs the full
    /// migration if any are missing.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
        async fn table_exists(pool: &SqlitePool, table: &str) -> bool {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
            )
            .bind(table)
            .fetch_one(pool)
            .await
            .unwrap_or(false)
        }

        let core_tables = [
            "users",
            "validations",
            "validation_requests",
            "ban_groups",
            "ban_group_entries",
            "groups",
            "members",
            "messages",
            "redirects",
            "pm_messages",
            "pm_bans",
        ];
        let mut core_ok = true;
        for t in core_tables {
            if !table_exists(pool, t).await {
                core_ok = false;
                break;
            }
        }

        if core_ok {
            info!("Database already initialized");
        } else {
            Self::run_migration_file(pool, include_str!("../../migrations/001_init.sql")).await;
            info!("Database migrations applied (001_init)");
        }

        Ok(())
    }

    /// Run a single migration file, executing each statement.
    async fn run_migration_file(pool: &SqlitePool, migration: &str) {
        for statement in migration.split(';') {
            let sql: Vec<&str> = statement
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("--"))
                .collect();
            if sql.is_empty() {
                continue;
            }
            let sql = sql.join("\n");

            if let Err(e) = sqlx::query(&sql).execute(pool).await {
                let err_str = e.to_string();
                if !err_str.contains("already exists") {
                    tracing::warn!(sql = %sql, error = %e, "Migration statement failed");
                }
            }
        }
    }

    /// Get user repository.
    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(&self.pool)
    }

    /// Get group repository.
    pub fn groups(&self) -> GroupRepository<'_> {
        GroupRepository::new(&self.pool)
    }

    /// Get member repository.
    pub fn members(&self) -> MemberRepository<'_> {
        MemberRepository::new(&self.pool)
    }

    /// Get message repository.
    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(&self.pool)
    }
}

/// Look up a ban entry inside a ban group, honoring the group's expiry.
///
/// Returns `Some(until)` when the ban group currently denies `ban`.
pub(crate) async fn live_ban_entry(
    pool: &SqlitePool,
    ban_group_id: i64,
    ban: models::BanType,
    now: i64,
) -> Result<Option<Option<i64>>, sqlx::Error> {
    let row = sqlx::query_as::<_, (Option<i64>,)>(
        r#"
        SELECT bg.until
        FROM ban_group_entries e
        JOIN ban_groups bg ON bg.id = e.ban_group_id
        WHERE e.ban_group_id = ? AND e.ban_type = ?
        "#,
    )
    .bind(ban_group_id)
    .bind(ban as i32)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((until,)) if until.is_none_or(|t| t > now) => Some(until),
        _ => None,
    })
}


/// Create a ban group with the given entries inside an open transaction and
/// return its id.
pub(crate) async fn generate_ban_group(
    tx: &mut sqlx::SqliteConnection,
    types: &[models::BanType],
    until: Option<i64>,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO ban_groups (until, created_at) VALUES (?, ?)")
        .bind(until)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    let id = result.last_insert_rowid();
    for t in types {
        sqlx::query("INSERT INTO ban_group_entries (ban_group_id, ban_type) VALUES (?, ?)")
            .bind(id)
            .bind(*t as i32)
            .execute(&mut *tx)
            .await?;
    }
    Ok(id)
}
