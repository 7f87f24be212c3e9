//! Invite and validation code issuance (the code half lives in
//! [`crate::db::UserRepository`]; this module owns generation and the
//! per-group invite-code store).

use crate::cache::{Cache, CacheError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dictionary-safe alphabet: digits without `0`, uppercase without `O`.
const CODE_ALPHABET: &[u8] = b"123456789ABCDEFGHIJKLMNPQRSTUVWXYZ";

/// Default invite-code length.
pub const INVITE_CODE_LEN: usize = 16;

/// Generate a random dictionary-safe code.
pub fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Value stored per invite code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteCode {
    /// The inviting member.
    pub member_id: i64,
    /// Remaining uses; `None` means unlimited.
    pub remaining: Option<u32>,
}

/// Per-group invite-code store, cache-backed with optional TTL.
#[derive(Clone)]
pub struct InviteCodes {
    cache: Cache,
}

impl InviteCodes {
    /// Keys live under `group.{token}.invite.code`.
    pub fn new(cache: &Cache, token: &str) -> Self {
        Self {
            cache: cache.scoped(&format!("group.{token}.invite.code")),
        }
    }

    /// Issue a code bound to `member_id` with the given use budget.
    pub async fn issue(
        &self,
        member_id: i64,
        uses: Option<u32>,
        ttl: Option<Duration>,
    ) -> Result<String, CacheError> {
        let code = generate_code(INVITE_CODE_LEN);
        self.cache
            .set(
                &code,
                &InviteCode {
                    member_id,
                    remaining: uses,
                },
                ttl,
            )
            .await?;
        Ok(code)
    }

    /// Look up a code without consuming it.
    pub async fn peek(&self, code: &str) -> Result<Option<InviteCode>, CacheError> {
        self.cache.get(code).await
    }

    /// Consume one use. Returns the code value when the redemption is
    /// accepted; `None` when the code is unknown or exhausted.
    pub async fn redeem(&self, code: &str) -> Result<Option<InviteCode>, CacheError> {
        let Some(mut value) = self.cache.get::<InviteCode>(code).await? else {
            return Ok(None);
        };
        match value.remaining {
            Some(0) => Ok(None),
            Some(n) => {
                value.remaining = Some(n - 1);
                self.cache.set(code, &value, None).await?;
                Ok(Some(value))
            }
            None => Ok(Some(value)),
        }
    }
}
