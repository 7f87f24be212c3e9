//! The group relay controller.
//!
//! One `Relay` per hosted bot credential: it owns the SDK connection, the
//! durable operation queue and its single consumer, the mask allocator, the
//! conversation map and the per-user lock table. Capability handlers are
//! split across the submodules; they all hang off this type.

mod admin;
mod commands;
mod conversation;
mod dispatch;
mod join;
mod pm;
mod send;

pub use conversation::{ConvStatus, Conversation, ConversationMap};
pub use dispatch::Concurrency;

use crate::cache::{Cache, CacheQueue};
use crate::codes::InviteCodes;
use crate::db::models::{GroupRow, UserRow};
use crate::db::Database;
use crate::error::{OpResult, OperationError};
use crate::mask::MaskPool;
use crate::voice::VoiceMasker;
use crate::worker::{Operation, Signal, WorkerCtx, WorkerStatus, run_worker};
use relay_sdk::{BotCommand, BotProfile, PlatformClient, SdkError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Boot timeout the fleet applies when waiting on [`Relay::booted`].
pub const BOOT_TIMEOUT_SECS: u64 = 120;

pub struct Relay {
    pub token: String,
    /// Short stable fingerprint of the token, used as the log span id.
    pub name: String,
    pub(crate) client: Arc<dyn PlatformClient>,
    pub(crate) db: Database,
    pub(crate) masks: MaskPool,
    pub(crate) queue: Arc<CacheQueue<Operation>>,
    pub(crate) status: Arc<WorkerStatus>,
    pub(crate) global_status: Arc<WorkerStatus>,
    pub(crate) voice: Arc<dyn VoiceMasker>,
    pub(crate) invites: InviteCodes,
    pub(crate) conversations: ConversationMap,
    pub(crate) invite_award_days: i64,
    user_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    group_id: OnceLock<i64>,
    profile: OnceLock<BotProfile>,
    creator: Option<UserRow>,
    /// Fired once boot has been attempted, successful or not.
    pub booted: Arc<Signal>,
    /// Fired when the relay dies (credential revoked, fatal error).
    pub failed: Arc<Signal>,
    boot_error: parking_lot::Mutex<Option<String>>,
    pub(crate) shutdown: CancellationToken,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: String,
        client: Arc<dyn PlatformClient>,
        db: Database,
        cache: Cache,
        global_status: Arc<WorkerStatus>,
        voice: Arc<dyn VoiceMasker>,
        creator: Option<UserRow>,
        invite_award_days: i64,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let digest = Sha256::digest(token.as_bytes());
        let name: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
        let masks = MaskPool::new(&cache, &token);
        let queue = Arc::new(CacheQueue::new(
            cache.clone(),
            format!("group.{token}.worker.queue"),
        ));
        let status = Arc::new(WorkerStatus::new(
            cache.clone(),
            format!("group.{token}.worker.status"),
        ));
        let invites = InviteCodes::new(&cache, &token);
        Arc::new(Self {
            token,
            name,
            client,
            db,
            masks,
            queue,
            status,
            global_status,
            voice,
            invites,
            conversations: ConversationMap::default(),
            invite_award_days,
            user_locks: Mutex::new(HashMap::new()),
            group_id: OnceLock::new(),
            profile: OnceLock::new(),
            creator,
            booted: Signal::new(),
            failed: Signal::new(),
            boot_error: parking_lot::Mutex::new(None),
            shutdown,
        })
    }

    /// Boot error text, when boot failed.
    pub fn boot_error(&self) -> Option<String> {
        self.boot_error.lock().clone()
    }

    /// Per-relay fan-out counters.
    pub fn worker_status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    pub fn profile(&self) -> Option<&BotProfile> {
        self.profile.get()
    }

    pub(crate) fn group_id(&self) -> OpResult<i64> {
        self.group_id
            .get()
            .copied()
            .ok_or_else(|| OperationError::Invalid("relay is not booted".to_string()))
    }

    /// The current group row, freshly read.
    pub async fn group(&self) -> OpResult<GroupRow> {
        let id = self.group_id()?;
        self.db
            .groups()
            .by_id(id)
            .await?
            .ok_or(OperationError::Storage)
    }

    /// Lifecycle: boot, serve updates until cancelled or failed, tear down.
    pub async fn run(self: Arc<Self>) {
        let boot = self.boot().await;
        match &boot {
            Ok(()) => {}
            Err(e) => {
                *self.boot_error.lock() = Some(e.notice());
                warn!(relay = %self.name, error = %e, "Relay boot failed");
            }
        }
        self.booted.fire();
        if boot.is_err() {
            self.failed.fire();
            return;
        }

        let username = self
            .profile()
            .map(|p| p.username.clone())
            .unwrap_or_default();
        info!(relay = %self.name, group = %username, "Now listening for updates");

        let worker_ctx = Arc::new(WorkerCtx {
            db: self.db.clone(),
            client: Arc::clone(&self.client),
            group_id: self.group_id.get().copied().unwrap_or_default(),
            status: Arc::clone(&self.status),
            global_status: Arc::clone(&self.global_status),
            voice: Arc::clone(&self.voice),
        });
        let worker = tokio::spawn(run_worker(
            worker_ctx,
            Arc::clone(&self.queue),
            self.shutdown.child_token(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.failed.wait() => break,
                update = self.client.next_update() => match update {
                    Some(update) => {
                        let relay = Arc::clone(&self);
                        tokio::spawn(async move { relay.handle_update(update).await });
                    }
                    None => break,
                },
            }
        }

        // Teardown: cancel tasks, close the client, persist the freshest
        // profile best-effort.
        self.shutdown.cancel();
        let _ = worker.await;
        if let Err(e) = self.client.disconnect().await {
            warn!(relay = %self.name, error = %e, "Client close failed");
        }
        if let (Some(group_id), Some(profile)) = (self.group_id.get(), self.profile.get()) {
            if let Err(e) = self.db.groups().save_profile(*group_id, profile).await {
                warn!(relay = %self.name, error = %e, "Profile save on stop failed");
            }
        }
        info!(relay = %self.name, group = %username, "Stopped listening for updates");
    }

    async fn boot(&self) -> OpResult<()> {
        let profile = match self.client.connect().await {
            Ok(profile) => profile,
            Err(e) => {
                if matches!(e, SdkError::UserDeactivated)
                    && let Ok(Some(group)) = self.db.groups().by_token(&self.token).await
                {
                    let _ = self.db.groups().set_disabled(group.id, true).await;
                    info!(group = %group.username, "Group disabled because its credential was deactivated");
                }
                return Err(e.into());
            }
        };

        let group = match self.db.groups().by_token(&self.token).await? {
            Some(group) => {
                if group.username != profile.username || group.title.as_deref() != Some(&profile.name)
                {
                    self.db.groups().save_profile(group.id, &profile).await?;
                }
                group
            }
            None => {
                let creator = self.creator.clone().ok_or_else(|| {
                    OperationError::Invalid("a creator is required to host a new group".to_string())
                })?;
                self.db
                    .groups()
                    .create_with_creator(&self.token, &profile, &creator, self.invite_award_days)
                    .await?
            }
        };
        self.group_id.set(group.id).ok();
        self.profile.set(profile).ok();

        if let Err(e) = self.client.set_bot_commands(&Self::commands()).await {
            warn!(relay = %self.name, error = %e, "Command registration failed");
        }

        let restored = self
            .queue
            .restore()
            .await
            .map_err(|e| OperationError::Invalid(format!("queue restore failed: {e}")))?;
        if restored > 0 {
            info!(relay = %self.name, restored, "Restored queued operations");
        }
        Ok(())
    }

    fn commands() -> Vec<BotCommand> {
        vec![
            BotCommand::new("start", "Show the panel"),
            BotCommand::new("delete", "Delete the replied-to message"),
            BotCommand::new("pm", "Message the replied-to member privately"),
            BotCommand::new("change", "Change to a random mask"),
            BotCommand::new("setmask", "Pin a mask"),
            BotCommand::new("invite", "Create an invite link"),
            BotCommand::new("leave", "Leave the group"),
            BotCommand::new("ban", "(admin/pm) Ban [member]"),
            BotCommand::new("unban", "(admin/pm) Unban [member]"),
            BotCommand::new("pin", "(admin) Pin the replied-to message"),
            BotCommand::new("unpin", "(admin) Unpin the replied-to message"),
            BotCommand::new("reveal", "(admin) Reveal the replied-to member"),
            BotCommand::new("manage", "(admin) Manage the replied-to member"),
        ]
    }

    /// The per-user lock backing the `queue`/`singleton` handler modes.
    pub(crate) async fn user_lock(&self, user_uid: i64) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user_uid).or_default())
    }

    /// Send a plain notice.
    pub(crate) async fn notify(&self, chat_id: i64, text: &str) -> Result<i64, SdkError> {
        self.client.send_message(chat_id, text, None, None).await
    }

    /// Send a notice that deletes itself after `secs`.
    pub(crate) fn notify_temp(&self, chat_id: i64, text: String, secs: u64) {
        let client = Arc::clone(&self.client);
        let name = self.name.clone();
        tokio::spawn(async move {
            match client.send_message(chat_id, &text, None, None).await {
                Ok(mid) => {
                    tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                    let _ = client.delete_messages(chat_id, &[mid]).await;
                }
                Err(e) => warn!(relay = %name, error = %e, "Notice send failed"),
            }
        });
    }

    /// Best-effort delete of an inbound message.
    pub(crate) async fn delete_inbound(&self, chat_id: i64, mid: i64) {
        let _ = self.client.delete_messages(chat_id, &[mid]).await;
    }
}
