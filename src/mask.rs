//! Per-relay mask allocator.
//!
//! Assigns each active member a unique single-emoji mask from a curated
//! alphabet. When the alphabet is exhausted the assignment idle the longest
//! is stolen, provided its holder has been idle for more than three days;
//! otherwise allocation fails. All operations hold the relay-local lock for
//! their duration and persist the table after every mutation.

use crate::cache::{Cache, CacheDict};
use crate::db::now_ts;
use crate::error::{OpResult, OperationError};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Idle window after which an assigned mask may be stolen.
const IDLE_STEAL_SECS: i64 = 3 * 86_400;

/// The curated mask alphabet: single grapheme-cluster emojis.
pub const MASK_ALPHABET: &[&str] = &[
    "🐶", "🐱", "🐹", "🐰", "🦊", "🐼", "🐯", "🐮", "🦁", "🐸", "🐵", "🐔", "🐧", "🐥", "🦆",
    "🦅", "🦉", "🦄", "🐝", "🦋", "🐌", "🐙", "🦖", "🦀", "🐠", "🐳", "🐘", "🐿", "👻", "🎃",
    "🦕", "🐡", "🎄", "🍄", "🍁", "🐚", "🧸", "🎩", "🕶", "🐟", "🐬", "🐲", "🚤", "🛶", "🦞",
    "🦑", "👽", "♠️", "♣️", "♥️", "♦️", "🃏", "🔮", "🛸", "⛵️", "🎲", "🧊", "🍩", "🍪", "🍭",
    "🌶", "🍗", "🍖", "☘️", "🤡", "🧩", "🌀", "🏮", "🪄", "🏀", "⚽️", "🏈", "🎱", "🪁", "🍥",
    "🍦", "🧁", "🍓", "🫐", "🍇", "🍉", "🍋", "🍐", "🍎", "🍒", "🍑", "🥝", "🍆", "🥑", "🥕",
    "🌽", "🥐", "🎷", "♟", "🏖", "🏔", "⚓️", "🛵", "🔯", "☮️", "☯️", "🆙", "🏴‍☠️", "⏳", "⛩",
    "🦧", "🌴", "🌷", "🌞", "🧶", "🧿",
];

/// One assignment: holding member and last-use timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaskSlot {
    pub member_id: i64,
    pub last_used: i64,
}

/// Persisted allocator state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskState {
    /// member id -> mask
    pub users: HashMap<i64, String>,
    /// mask -> assignment
    pub masks: HashMap<String, MaskSlot>,
}

/// Per-relay allocator. Not shared across relays.
pub struct MaskPool {
    dict: CacheDict<MaskState>,
    state: Mutex<Option<MaskState>>,
}

impl MaskPool {
    /// State lives under `group.{token}.unique_mask`.
    pub fn new(cache: &Cache, token: &str) -> Self {
        Self {
            dict: CacheDict::new(cache.clone(), format!("group.{token}.unique_mask")),
            state: Mutex::new(None),
        }
    }

    /// Current mask of a member, without mutation.
    pub async fn mask_for(&self, member_id: i64) -> Option<String> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await;
        state.users.get(&member_id).cloned()
    }

    /// Resolve the member's mask.
    ///
    /// With `renew = false` an existing assignment is refreshed and returned
    /// as `(created = false, mask)`. With `renew = true`, or when the member
    /// has no mask, a new one is allocated and returned as `(true, mask)`.
    pub async fn get_mask(&self, member_id: i64, renew: bool) -> OpResult<(bool, String)> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await;
        let now = now_ts();

        if let Some(current) = state.users.get(&member_id).cloned() {
            if !renew {
                state.masks.insert(
                    current.clone(),
                    MaskSlot {
                        member_id,
                        last_used: now,
                    },
                );
                self.save(state).await;
                return Ok((false, current));
            }
            let fresh = allocate(state, now)?;
            state.masks.remove(&current);
            state.users.insert(member_id, fresh.clone());
            state.masks.insert(
                fresh.clone(),
                MaskSlot {
                    member_id,
                    last_used: now,
                },
            );
            self.save(state).await;
            return Ok((true, fresh));
        }

        let fresh = allocate(state, now)?;
        state.users.insert(member_id, fresh.clone());
        state.masks.insert(
            fresh.clone(),
            MaskSlot {
                member_id,
                last_used: now,
            },
        );
        self.save(state).await;
        Ok((true, fresh))
    }

    /// Explicitly claim `desired` (used by `/setmask`). Succeeds when it is
    /// unassigned or its holder has been idle beyond the steal window.
    pub async fn take_mask(&self, member_id: i64, desired: &str) -> bool {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await;
        let now = now_ts();

        if let Some(slot) = state.masks.get(desired) {
            if slot.member_id != member_id && now - slot.last_used <= IDLE_STEAL_SECS {
                return false;
            }
            let evicted = slot.member_id;
            if evicted != member_id {
                state.users.remove(&evicted);
            }
        }
        if let Some(previous) = state.users.insert(member_id, desired.to_string()) {
            if previous != desired {
                state.masks.remove(&previous);
            }
        }
        state.masks.insert(
            desired.to_string(),
            MaskSlot {
                member_id,
                last_used: now,
            },
        );
        self.save(state).await;
        true
    }

    async fn loaded<'a>(&self, guard: &'a mut Option<MaskState>) -> &'a mut MaskState {
        if guard.is_none() {
            *guard = Some(self.dict.load().await);
        }
        guard.as_mut().unwrap()
    }

    async fn save(&self, state: &MaskState) {
        if let Err(e) = self.dict.save(state).await {
            tracing::warn!(error = %e, "Mask table write failed");
        }
    }
}

/// Allocation policy: a uniformly random unused emoji, else steal the
/// longest-idle assignment past the steal window, else fail.
fn allocate(state: &mut MaskState, now: i64) -> OpResult<String> {
    let unused: Vec<&&str> = MASK_ALPHABET
        .iter()
        .filter(|e| !state.masks.contains_key(**e))
        .collect();
    if let Some(chosen) = unused.choose(&mut rand::thread_rng()) {
        return Ok((***chosen).to_string());
    }

    let mut oldest: Option<(&String, &MaskSlot)> = None;
    for (mask, slot) in &state.masks {
        if now - slot.last_used <= IDLE_STEAL_SECS {
            continue;
        }
        match oldest {
            Some((_, best)) if best.last_used <= slot.last_used => {}
            _ => oldest = Some((mask, slot)),
        }
    }
    match oldest {
        Some((mask, slot)) => {
            let mask = mask.clone();
            let evicted = slot.member_id;
            state.users.remove(&evicted);
            Ok(mask)
        }
        None => Err(OperationError::MaskNotAvailable),
    }
}
