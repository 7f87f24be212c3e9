//! RPC error taxonomy.
//!
//! The relay core never inspects raw platform errors; every failure is
//! classified here. Transient failures (rate limits, network hiccups) are
//! retried inside the client implementations and normally never reach the
//! core.

use thiserror::Error;

/// Errors surfaced by a [`crate::PlatformClient`].
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    /// The recipient has blocked the bot.
    #[error("user has blocked the bot")]
    UserBlocked,

    /// The peer account no longer exists. Also raised at connect time when
    /// the bot credential itself has been revoked.
    #[error("user is deactivated")]
    UserDeactivated,

    /// Edit targeted a message with identical content.
    #[error("message is not modified")]
    MessageNotModified,

    /// Flood control. Clients retry these transparently; the variant only
    /// escapes when the retry budget is exhausted.
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl SdkError {
    /// Static label for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UserBlocked => "user_blocked",
            Self::UserDeactivated => "user_deactivated",
            Self::MessageNotModified => "message_not_modified",
            Self::RateLimited(_) => "rate_limited",
            Self::Network(_) => "network",
            Self::Rpc(_) => "rpc",
        }
    }

    /// Terminal per-recipient failure: the peer cannot be reached now or
    /// ever. Fan-out downgrades such recipients instead of aborting.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::UserBlocked | Self::UserDeactivated)
    }

    /// Worth retrying at the transport layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_))
    }
}
