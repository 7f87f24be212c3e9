//! Fan-out accounting: cumulative `(time, requests, errors)` counters,
//! kept per relay and process-wide, persisted through the cache store.

use crate::cache::{Cache, CacheDict};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounters {
    /// Total seconds operations spent from enqueue to completion.
    pub time: f64,
    pub requests: u64,
    pub errors: u64,
}

impl StatusCounters {
    /// Mean propagation delay per outbound request, when any were made.
    pub fn mean_delay(&self) -> Option<f64> {
        (self.requests > 0).then(|| self.time / self.requests as f64)
    }
}

/// Mutex-guarded accumulator backed by a cache dict.
pub struct WorkerStatus {
    dict: CacheDict<StatusCounters>,
    inner: Mutex<Option<StatusCounters>>,
}

impl WorkerStatus {
    pub fn new(cache: Cache, key: impl Into<String>) -> Self {
        Self {
            dict: CacheDict::new(cache, key),
            inner: Mutex::new(None),
        }
    }

    /// Fold one finished operation into the counters and persist.
    pub async fn report(&self, secs: f64, requests: u32, errors: u32) {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(self.dict.load().await);
        }
        let counters = guard.as_mut().unwrap();
        counters.time += secs;
        counters.requests += u64::from(requests);
        counters.errors += u64::from(errors);
        if let Err(e) = self.dict.save(counters).await {
            tracing::warn!(error = %e, "Worker status write failed");
        }
    }

    pub async fn snapshot(&self) -> StatusCounters {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(self.dict.load().await);
        }
        *guard.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBacking;
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_accumulate_and_persist() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let status = WorkerStatus::new(cache.clone(), "system.statistics.worker.status");

        status.report(2.0, 10, 1).await;
        status.report(3.0, 5, 0).await;

        let snapshot = status.snapshot().await;
        assert_eq!(snapshot.requests, 15);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.time - 5.0).abs() < f64::EPSILON);
        assert!((snapshot.mean_delay().unwrap() - (5.0 / 15.0)).abs() < 1e-9);

        // A fresh handle over the same backing sees the persisted counters.
        let reloaded = WorkerStatus::new(cache, "system.statistics.worker.status");
        assert_eq!(reloaded.snapshot().await, snapshot);
    }

    #[tokio::test]
    async fn empty_counters_have_no_mean() {
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let status = WorkerStatus::new(cache, "s");
        assert!(status.snapshot().await.mean_delay().is_none());
    }
}
