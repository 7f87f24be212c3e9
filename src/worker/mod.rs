//! Per-relay operation queue types.
//!
//! Every inbound event that fans out is expressed as a tagged [`Operation`]
//! carried by the durable queue. Operations hold an [`OpState`] with live
//! request/error counters and a one-shot completion [`Signal`]; the durable
//! view ([`OpView`]) strips both, and rehydration allocates fresh ones, so a
//! restored queue never resumes with fired signals.

pub mod bulk;
pub mod fanout;
mod status;

pub use fanout::{WorkerCtx, compose_masked, run_worker};
pub use status::{StatusCounters, WorkerStatus};

use crate::cache::Durable;
use crate::db::now_ts;
use relay_sdk::InboundMessage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Notify;

/// One-shot completion signal. Firing is idempotent; waiting after the fire
/// returns immediately.
#[derive(Debug, Default)]
pub struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_fired() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared mutable half of an operation: counters the caller reads while the
/// worker runs, and the completion signal.
#[derive(Debug)]
pub struct OpState {
    pub requests: AtomicU32,
    pub errors: AtomicU32,
    pub finished: Arc<Signal>,
    pub created_at: i64,
}

impl OpState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            finished: Signal::new(),
            created_at: now_ts(),
        })
    }

    fn with_created(created_at: i64) -> Arc<Self> {
        Arc::new(Self {
            requests: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            finished: Signal::new(),
            created_at,
        })
    }

    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// (requests, errors)
    pub fn counts(&self) -> (u32, u32) {
        (
            self.requests.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// A queued fan-out operation. `message_id` fields reference message rows;
/// the worker re-reads them at execution time so a restored queue acts on
/// fresh state.
pub enum Operation {
    Broadcast {
        source: InboundMessage,
        sender_member_id: i64,
        message_id: i64,
        state: Arc<OpState>,
    },
    Edit {
        source: InboundMessage,
        sender_member_id: i64,
        message_id: i64,
        state: Arc<OpState>,
    },
    Delete {
        message_id: i64,
        state: Arc<OpState>,
    },
    Pin {
        message_id: i64,
        state: Arc<OpState>,
    },
    Unpin {
        message_id: i64,
        state: Arc<OpState>,
    },
    BulkRedirect {
        message_ids: Vec<i64>,
        member_id: i64,
        state: Arc<OpState>,
    },
    BulkPin {
        message_ids: Vec<i64>,
        member_id: i64,
        state: Arc<OpState>,
    },
}

impl Operation {
    pub fn state(&self) -> &Arc<OpState> {
        match self {
            Operation::Broadcast { state, .. }
            | Operation::Edit { state, .. }
            | Operation::Delete { state, .. }
            | Operation::Pin { state, .. }
            | Operation::Unpin { state, .. }
            | Operation::BulkRedirect { state, .. }
            | Operation::BulkPin { state, .. } => state,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operation::Broadcast { .. } => "broadcast",
            Operation::Edit { .. } => "edit",
            Operation::Delete { .. } => "delete",
            Operation::Pin { .. } => "pin",
            Operation::Unpin { .. } => "unpin",
            Operation::BulkRedirect { .. } => "bulk_redirect",
            Operation::BulkPin { .. } => "bulk_pin",
        }
    }

    /// Bulk operations run on detached tasks, off the main consumer.
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            Operation::BulkRedirect { .. } | Operation::BulkPin { .. }
        )
    }
}

/// Durable view of an [`Operation`]: the fields minus signal and counters.
#[derive(Serialize, Deserialize)]
pub enum OpView {
    Broadcast {
        source: InboundMessage,
        sender_member_id: i64,
        message_id: i64,
        created_at: i64,
    },
    Edit {
        source: InboundMessage,
        sender_member_id: i64,
        message_id: i64,
        created_at: i64,
    },
    Delete {
        message_id: i64,
        created_at: i64,
    },
    Pin {
        message_id: i64,
        created_at: i64,
    },
    Unpin {
        message_id: i64,
        created_at: i64,
    },
    BulkRedirect {
        message_ids: Vec<i64>,
        member_id: i64,
        created_at: i64,
    },
    BulkPin {
        message_ids: Vec<i64>,
        member_id: i64,
        created_at: i64,
    },
}

impl Durable for Operation {
    type View = OpView;

    fn to_view(&self) -> OpView {
        match self {
            Operation::Broadcast {
                source,
                sender_member_id,
                message_id,
                state,
            } => OpView::Broadcast {
                source: source.clone(),
                sender_member_id: *sender_member_id,
                message_id: *message_id,
                created_at: state.created_at,
            },
            Operation::Edit {
                source,
                sender_member_id,
                message_id,
                state,
            } => OpView::Edit {
                source: source.clone(),
                sender_member_id: *sender_member_id,
                message_id: *message_id,
                created_at: state.created_at,
            },
            Operation::Delete { message_id, state } => OpView::Delete {
                message_id: *message_id,
                created_at: state.created_at,
            },
            Operation::Pin { message_id, state } => OpView::Pin {
                message_id: *message_id,
                created_at: state.created_at,
            },
            Operation::Unpin { message_id, state } => OpView::Unpin {
                message_id: *message_id,
                created_at: state.created_at,
            },
            Operation::BulkRedirect {
                message_ids,
                member_id,
                state,
            } => OpView::BulkRedirect {
                message_ids: message_ids.clone(),
                member_id: *member_id,
                created_at: state.created_at,
            },
            Operation::BulkPin {
                message_ids,
                member_id,
                state,
            } => OpView::BulkPin {
                message_ids: message_ids.clone(),
                member_id: *member_id,
                created_at: state.created_at,
            },
        }
    }

    fn rehydrate(view: OpView) -> Operation {
        match view {
            OpView::Broadcast {
                source,
                sender_member_id,
                message_id,
                created_at,
            } => Operation::Broadcast {
                source,
                sender_member_id,
                message_id,
                state: OpState::with_created(created_at),
            },
            OpView::Edit {
                source,
                sender_member_id,
                message_id,
                created_at,
            } => Operation::Edit {
                source,
                sender_member_id,
                message_id,
                state: OpState::with_created(created_at),
            },
            OpView::Delete {
                message_id,
                created_at,
            } => Operation::Delete {
                message_id,
                state: OpState::with_created(created_at),
            },
            OpView::Pin {
                message_id,
                created_at,
            } => Operation::Pin {
                message_id,
                state: OpState::with_created(created_at),
            },
            OpView::Unpin {
                message_id,
                created_at,
            } => Operation::Unpin {
                message_id,
                state: OpState::with_created(created_at),
            },
            OpView::BulkRedirect {
                message_ids,
                member_id,
                created_at,
            } => Operation::BulkRedirect {
                message_ids,
                member_id,
                state: OpState::with_created(created_at),
            },
            OpView::BulkPin {
                message_ids,
                member_id,
                created_at,
            } => Operation::BulkPin {
                message_ids,
                member_id,
                state: OpState::with_created(created_at),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_is_one_shot_and_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        signal.fire();
        signal.fire();
        assert!(signal.is_fired());
        signal.wait().await; // returns immediately
    }

    #[tokio::test]
    async fn signal_wakes_waiters() {
        let signal = Signal::new();
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        signal.fire();
        waiter.await.unwrap();
    }

    #[test]
    fn rehydrated_ops_get_fresh_state() {
        let op = Operation::Delete {
            message_id: 9,
            state: OpState::new(),
        };
        op.state().add_request();
        op.state().finished.fire();

        let restored = Operation::rehydrate(op.to_view());
        let (requests, errors) = restored.state().counts();
        assert_eq!((requests, errors), (0, 0));
        assert!(!restored.state().finished.is_fired());
        assert_eq!(restored.state().created_at, op.state().created_at);
    }
}
