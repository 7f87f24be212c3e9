//! Durable FIFO queue over the cache backing.
//!
//! Operations carry live one-shot completion signals and client handles that
//! must not be serialized. Each queued type therefore defines a durable
//! view ([`Durable::View`]) that strips those members, and a `rehydrate`
//! that re-attaches freshly allocated ones on restore. This is a required
//! contract: signals restored from the backing must be fresh and unfired.

use super::{Cache, CacheError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// A queue element with a serializable durable view.
pub trait Durable: Send {
    type View: Serialize + DeserializeOwned + Send;

    /// Strip non-serializable members (signals, client back-references).
    fn to_view(&self) -> Self::View;

    /// Re-attach fresh non-serializable members.
    fn rehydrate(view: Self::View) -> Self;
}

/// In-memory FIFO mirrored to the backing after each mutation.
pub struct CacheQueue<T: Durable> {
    cache: Cache,
    key: String,
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T: Durable> CacheQueue<T> {
    pub fn new(cache: Cache, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Restore the mirror from the backing. Called once at relay boot,
    /// before the consumer starts. Returns how many items were restored.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let views: Vec<T::View> = self.cache.get(&self.key).await?.unwrap_or_default();
        let mut queue = self.inner.lock().await;
        let count = views.len();
        for view in views {
            queue.push_back(T::rehydrate(view));
        }
        drop(queue);
        if count > 0 {
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Append an item and persist the mirror.
    pub async fn put(&self, item: T) -> Result<(), CacheError> {
        let mut queue = self.inner.lock().await;
        queue.push_back(item);
        self.persist(&queue).await?;
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the next item in FIFO order, waiting for one if the queue is
    /// empty. The mirror is persisted after the pop; persistence failures
    /// are logged, never block the consumer.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut queue = self.inner.lock().await;
                if let Some(item) = queue.pop_front() {
                    if let Err(e) = self.persist(&queue).await {
                        tracing::warn!(key = %self.key, error = %e, "Queue mirror write failed");
                    }
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return item;
                }
            }
            notified.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    async fn persist(&self, queue: &VecDeque<T>) -> Result<(), CacheError> {
        let views: Vec<T::View> = queue.iter().map(Durable::to_view).collect();
        self.cache.set(&self.key, &views, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBacking;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Toy op: a payload plus a non-serializable "signal".
    struct Op {
        payload: String,
        fired: Arc<AtomicBool>,
    }

    #[derive(Serialize, Deserialize)]
    struct OpView {
        payload: String,
    }

    impl Durable for Op {
        type View = OpView;

        fn to_view(&self) -> OpView {
            OpView {
                payload: self.payload.clone(),
            }
        }

        fn rehydrate(view: OpView) -> Self {
            Op {
                payload: view.payload,
                fired: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    fn op(payload: &str) -> Op {
        Op {
            payload: payload.to_string(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let queue: CacheQueue<Op> = CacheQueue::new(cache, "t.queue");

        queue.put(op("a")).await.unwrap();
        queue.put(op("b")).await.unwrap();
        queue.put(op("c")).await.unwrap();

        assert_eq!(queue.get().await.payload, "a");
        assert_eq!(queue.get().await.payload, "b");
        assert_eq!(queue.get().await.payload, "c");
    }

    #[tokio::test]
    async fn restart_restores_items_with_fresh_signals() {
        let backing: Arc<MemoryBacking> = Arc::new(MemoryBacking::new());
        let cache = Cache::new(backing.clone());

        let queue: CacheQueue<Op> = CacheQueue::new(cache.clone(), "t.queue");
        let first = op("a");
        first.fired.store(true, Ordering::Relaxed);
        queue.put(first).await.unwrap();
        queue.put(op("b")).await.unwrap();

        // Simulated restart: a fresh queue over the same backing.
        let restored: CacheQueue<Op> = CacheQueue::new(cache, "t.queue");
        assert_eq!(restored.restore().await.unwrap(), 2);

        let a = restored.get().await;
        assert_eq!(a.payload, "a");
        assert!(!a.fired.load(Ordering::Relaxed), "restored signals must be unfired");
        assert_eq!(restored.get().await.payload, "b");
    }

    #[tokio::test]
    async fn get_waits_for_put() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let queue: Arc<CacheQueue<Op>> = Arc::new(CacheQueue::new(cache, "t.queue"));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await.payload })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.put(op("late")).await.unwrap();
        assert_eq!(waiter.await.unwrap(), "late");
    }
}
