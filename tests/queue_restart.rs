//! Crash-durability of the per-relay operation queue.

use maskrelay::cache::{Cache, CacheQueue, MemoryBacking};
use maskrelay::worker::{OpState, Operation};
use relay_sdk::{InboundMessage, PeerInfo};
use std::sync::Arc;

fn source(mid: i64, text: &str) -> InboundMessage {
    InboundMessage {
        mid,
        chat_id: 10,
        from: PeerInfo {
            id: 10,
            username: None,
            first_name: Some("A".into()),
            last_name: None,
        },
        text: Some(text.to_string()),
        caption: None,
        media: None,
        entities: Vec::new(),
        has_markup: false,
        reply_to_mid: None,
    }
}

#[tokio::test]
async fn operations_survive_a_restart_in_order_with_fresh_signals() {
    let cache = Cache::new(Arc::new(MemoryBacking::new()));
    let key = "group.tok.worker.queue";

    {
        let queue: CacheQueue<Operation> = CacheQueue::new(cache.clone(), key);
        let state = OpState::new();
        state.add_request();
        state.add_error();
        state.finished.fire();
        queue
            .put(Operation::Broadcast {
                source: source(1, "first"),
                sender_member_id: 7,
                message_id: 100,
                state,
            })
            .await
            .unwrap();
        queue
            .put(Operation::Delete {
                message_id: 101,
                state: OpState::new(),
            })
            .await
            .unwrap();
        queue
            .put(Operation::BulkRedirect {
                message_ids: vec![100, 101],
                member_id: 8,
                state: OpState::new(),
            })
            .await
            .unwrap();
        // The first process dies here without draining.
    }

    // A fresh process restores the mirror from the backing.
    let restored: CacheQueue<Operation> = CacheQueue::new(cache.clone(), key);
    assert_eq!(restored.restore().await.unwrap(), 3);

    let first = restored.get().await;
    match &first {
        Operation::Broadcast {
            source,
            sender_member_id,
            message_id,
            state,
        } => {
            assert_eq!(source.text.as_deref(), Some("first"));
            assert_eq!(*sender_member_id, 7);
            assert_eq!(*message_id, 100);
            // Counters and the completion signal come back fresh.
            assert_eq!(state.counts(), (0, 0));
            assert!(!state.finished.is_fired());
        }
        other => panic!("wrong op restored first: {}", other.label()),
    }

    assert!(matches!(
        restored.get().await,
        Operation::Delete { message_id: 101, .. }
    ));
    match restored.get().await {
        Operation::BulkRedirect {
            message_ids,
            member_id,
            ..
        } => {
            assert_eq!(message_ids, vec![100, 101]);
            assert_eq!(member_id, 8);
        }
        other => panic!("wrong op restored last: {}", other.label()),
    }

    // Draining persisted the now-empty mirror: another restore finds nothing.
    let empty: CacheQueue<Operation> = CacheQueue::new(cache, key);
    assert_eq!(empty.restore().await.unwrap(), 0);
}

#[tokio::test]
async fn consumed_items_disappear_from_the_mirror() {
    let cache = Cache::new(Arc::new(MemoryBacking::new()));
    let key = "group.tok2.worker.queue";

    let queue: CacheQueue<Operation> = CacheQueue::new(cache.clone(), key);
    queue
        .put(Operation::Pin {
            message_id: 1,
            state: OpState::new(),
        })
        .await
        .unwrap();
    queue
        .put(Operation::Unpin {
            message_id: 2,
            state: OpState::new(),
        })
        .await
        .unwrap();
    let _ = queue.get().await;

    let restored: CacheQueue<Operation> = CacheQueue::new(cache, key);
    assert_eq!(restored.restore().await.unwrap(), 1);
    assert!(matches!(
        restored.get().await,
        Operation::Unpin { message_id: 2, .. }
    ));
}
