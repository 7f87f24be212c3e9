//! Domain error taxonomy.
//!
//! `OperationError` is the user-visible failure channel: it is rendered as an
//! ephemeral notice in the offending chat and never crashes a relay. Storage
//! and platform failures are folded in with their detail logged, not shown.

use crate::db::DbError;
use crate::db::models::{BanType, MemberRole, UserRole};
use chrono::{DateTime, Utc};
use relay_sdk::SdkError;
use thiserror::Error;

/// User-visible domain failure.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("user role requirement not met")]
    UserRole { roles: Vec<UserRole>, reversed: bool },

    #[error("member role requirement not met")]
    MemberRole { role: MemberRole, reversed: bool },

    #[error("capability denied")]
    Ban {
        ban: BanType,
        /// Whether the member override (true) or the group default (false)
        /// produced the denial.
        member_scope: bool,
        until: Option<DateTime<Utc>>,
    },

    #[error("no mask is currently available")]
    MaskNotAvailable,

    /// Bad input or state conflict, with a ready-made message.
    #[error("{0}")]
    Invalid(String),

    #[error("storage failure")]
    Storage,

    #[error("platform error: {0}")]
    Rpc(#[from] SdkError),
}

impl From<DbError> for OperationError {
    fn from(e: DbError) -> Self {
        tracing::error!(error = %e, "Storage operation failed");
        OperationError::Storage
    }
}

impl OperationError {
    /// Static label for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UserRole { .. } => "user_role",
            Self::MemberRole { .. } => "member_role",
            Self::Ban { .. } => "ban",
            Self::MaskNotAvailable => "mask_not_available",
            Self::Invalid(_) => "invalid",
            Self::Storage => "storage",
            Self::Rpc(_) => "rpc",
        }
    }

    /// The text shown to the user as an ephemeral notice.
    pub fn notice(&self) -> String {
        match self {
            Self::UserRole { roles, reversed } => {
                let list = roles
                    .iter()
                    .map(|r| r.display())
                    .collect::<Vec<_>>()
                    .join(" or ");
                if *reversed {
                    format!("you are a {list}")
                } else {
                    format!("you are not a {list}")
                }
            }
            Self::MemberRole { role, reversed } => {
                if *reversed {
                    format!("you are a {} of this group", role.display())
                } else {
                    format!("you are not a {} of this group", role.display())
                }
            }
            Self::Ban {
                ban,
                member_scope,
                until,
            } => {
                let who = if *member_scope { "you" } else { "everyone" };
                let until = until
                    .map(|t| format!(" until {}", t.format("%Y-%m-%d %H:%M")))
                    .unwrap_or_default();
                format!("{who} cannot {} in this group{until}", ban.display())
            }
            Self::MaskNotAvailable => {
                "no mask is currently available, please try again later".to_string()
            }
            Self::Invalid(msg) => msg.clone(),
            Self::Storage | Self::Rpc(_) => "an error occurred".to_string(),
        }
    }
}

/// Result type for relay operations.
pub type OpResult<T> = Result<T, OperationError>;
