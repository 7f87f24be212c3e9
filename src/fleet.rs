//! Fleet supervisor: owns every relay's lifecycle.
//!
//! Relays are started through a queue drained by a monitor task. Boot waits
//! are bounded; a relay whose boot fails surfaces its error to the caller
//! and is evicted. Cancellation cascades from the fleet token to every
//! relay and from there to workers and bulk tasks.

use crate::cache::Cache;
use crate::db::Database;
use crate::db::models::UserRow;
use crate::error::{OpResult, OperationError};
use crate::relay::{BOOT_TIMEOUT_SECS, Relay};
use crate::voice::VoiceMasker;
use crate::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_sdk::ClientFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct StartRequest {
    token: String,
    creator: Option<UserRow>,
}

struct RelayHandle {
    relay: Arc<Relay>,
    task: JoinHandle<()>,
}

pub struct Fleet {
    db: Database,
    cache: Cache,
    factory: Arc<dyn ClientFactory>,
    voice: Arc<dyn VoiceMasker>,
    invite_award_days: i64,
    relays: DashMap<String, RelayHandle>,
    start_tx: mpsc::UnboundedSender<StartRequest>,
    start_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<StartRequest>>>,
    /// Process-wide fan-out counters, shared with every relay.
    pub worker_status: Arc<WorkerStatus>,
    pub start_time: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl Fleet {
    pub fn new(
        db: Database,
        cache: Cache,
        factory: Arc<dyn ClientFactory>,
        voice: Arc<dyn VoiceMasker>,
        invite_award_days: i64,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (start_tx, start_rx) = mpsc::unbounded_channel();
        let worker_status = Arc::new(WorkerStatus::new(
            cache.clone(),
            "system.statistics.worker.status",
        ));
        Arc::new(Self {
            db,
            cache,
            factory,
            voice,
            invite_award_days,
            relays: DashMap::new(),
            start_tx,
            start_rx: tokio::sync::Mutex::new(Some(start_rx)),
            worker_status,
            start_time: Utc::now(),
            shutdown,
        })
    }

    /// Spawn the monitor task and enqueue every enabled group.
    pub async fn run(self: Arc<Self>) -> OpResult<JoinHandle<()>> {
        let rx = self
            .start_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| OperationError::Invalid("fleet is already running".to_string()))?;
        let monitor = {
            let fleet = Arc::clone(&self);
            tokio::spawn(async move { fleet.monitor(rx).await })
        };

        let groups = self.db.groups().all_enabled().await?;
        let count = groups.len();
        for group in groups {
            let _ = self.start_tx.send(StartRequest {
                token: group.token,
                creator: None,
            });
        }
        info!(count, "Enqueued group relays for startup");
        Ok(monitor)
    }

    async fn monitor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<StartRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if let Some(handle) = self.relays.get(&request.token)
                && !handle.task.is_finished()
            {
                continue;
            }
            let relay = Relay::new(
                request.token.clone(),
                self.factory.create(&request.token),
                self.db.clone(),
                self.cache.clone(),
                Arc::clone(&self.worker_status),
                Arc::clone(&self.voice),
                request.creator,
                self.invite_award_days,
                self.shutdown.child_token(),
            );
            let task = tokio::spawn(Arc::clone(&relay).run());
            self.relays.insert(request.token, RelayHandle { relay, task });
        }
    }

    /// Start (or return the already-running) relay for `token`, waiting for
    /// its boot to finish. Boot failures surface as errors.
    pub async fn start_group_bot(
        &self,
        token: &str,
        creator: Option<UserRow>,
    ) -> OpResult<Arc<Relay>> {
        if let Some(handle) = self.relays.get(token)
            && !handle.task.is_finished()
        {
            return Ok(Arc::clone(&handle.relay));
        }
        self.start_tx
            .send(StartRequest {
                token: token.to_string(),
                creator,
            })
            .map_err(|_| OperationError::Invalid("fleet is shutting down".to_string()))?;

        // The monitor inserts the handle before the relay boots; poll for it
        // briefly, then wait on the boot signal.
        let relay = {
            let mut relay = None;
            for _ in 0..100 {
                if let Some(handle) = self.relays.get(token) {
                    relay = Some(Arc::clone(&handle.relay));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            relay.ok_or_else(|| {
                OperationError::Invalid("relay failed to schedule".to_string())
            })?
        };

        if tokio::time::timeout(Duration::from_secs(BOOT_TIMEOUT_SECS), relay.booted.wait())
            .await
            .is_err()
        {
            self.stop_group_bot(token).await;
            return Err(OperationError::Invalid(
                "timed out starting the group relay".to_string(),
            ));
        }
        if let Some(error) = relay.boot_error() {
            self.stop_group_bot(token).await;
            return Err(OperationError::Invalid(error));
        }
        Ok(relay)
    }

    /// Cancel and evict a relay.
    pub async fn stop_group_bot(&self, token: &str) {
        if let Some((_, handle)) = self.relays.remove(token) {
            handle.relay.shutdown.cancel();
            if let Err(e) = handle.task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Relay task join failed");
                }
            }
        }
    }

    /// A running relay, if any.
    pub fn relay(&self, token: &str) -> Option<Arc<Relay>> {
        self.relays
            .get(token)
            .filter(|h| !h.task.is_finished())
            .map(|h| Arc::clone(&h.relay))
    }

    pub fn running_count(&self) -> usize {
        self.relays
            .iter()
            .filter(|h| !h.task.is_finished())
            .count()
    }

    /// Cascade cancellation to every relay and wait for them to stop.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let tokens: Vec<String> = self.relays.iter().map(|e| e.key().clone()).collect();
        for token in tokens {
            self.stop_group_bot(&token).await;
        }
    }
}
