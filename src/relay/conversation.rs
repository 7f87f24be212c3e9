//! Per-relay conversation state.
//!
//! A `(chat, user)` pair can be parked in exactly one status; the next
//! inbound message from that pair consumes and clears it. There are no
//! other transitions.

use crate::worker::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// What the next message from a (chat, user) means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStatus {
    /// Next text is a redeem code.
    UseCode,
    /// Next text carries a new bot token.
    NgToken,
    /// Welcome message body being edited.
    EwmmMessage,
    /// Welcome message buttons being edited.
    EwmmButton,
    /// Chat instruction being edited.
    EciInstruction,
    /// Group password being set.
    EpPassword,
    /// User's password attempt on join.
    GpPassword,
    /// User setting a pinned mask.
    SmMask,
    /// User must acknowledge the chat instruction before the first send.
    CiConfirm,
}

/// A parked conversation.
#[derive(Clone)]
pub struct Conversation {
    pub status: ConvStatus,
    /// The prompt message to clean up once the conversation resolves.
    pub prompt_mid: Option<i64>,
    /// One-shot carrier for `CiConfirm`.
    pub confirm: Option<Arc<Signal>>,
}

impl Conversation {
    pub fn new(status: ConvStatus) -> Self {
        Self {
            status,
            prompt_mid: None,
            confirm: None,
        }
    }

    pub fn with_prompt(status: ConvStatus, prompt_mid: i64) -> Self {
        Self {
            status,
            prompt_mid: Some(prompt_mid),
            confirm: None,
        }
    }
}

/// `(chat_id, user_id) -> Conversation`, relay-local. Clones share state.
#[derive(Clone, Default)]
pub struct ConversationMap {
    inner: Arc<Mutex<HashMap<(i64, i64), Conversation>>>,
}

impl ConversationMap {
    /// Park or clear (with `None`) the conversation for a pair.
    pub fn set(&self, chat_id: i64, user_id: i64, conversation: Option<Conversation>) {
        let mut inner = self.inner.lock();
        match conversation {
            Some(conversation) => {
                inner.insert((chat_id, user_id), conversation);
            }
            None => {
                inner.remove(&(chat_id, user_id));
            }
        }
    }

    /// Consume the parked conversation, clearing it.
    pub fn take(&self, chat_id: i64, user_id: i64) -> Option<Conversation> {
        self.inner.lock().remove(&(chat_id, user_id))
    }

    pub fn status_of(&self, chat_id: i64, user_id: i64) -> Option<ConvStatus> {
        self.inner.lock().get(&(chat_id, user_id)).map(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_status() {
        let map = ConversationMap::default();
        map.set(1, 2, Some(Conversation::new(ConvStatus::UseCode)));
        assert_eq!(map.status_of(1, 2), Some(ConvStatus::UseCode));
        assert!(map.take(1, 2).is_some());
        assert!(map.take(1, 2).is_none());
    }

    #[test]
    fn setting_none_clears() {
        let map = ConversationMap::default();
        map.set(1, 2, Some(Conversation::new(ConvStatus::SmMask)));
        map.set(1, 2, None);
        assert_eq!(map.status_of(1, 2), None);
    }
}
