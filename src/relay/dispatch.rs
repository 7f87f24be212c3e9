//! Inbound update dispatch and the handler gate.

use super::Relay;
use crate::db::models::{GroupRow, MemberRole, MemberRow};
use crate::error::{OpResult, OperationError};
use relay_sdk::{InboundMessage, SdkError, Update};
use tracing::{info, warn};

/// Concurrency mode of a handler for one (user, relay).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Any number of concurrent invocations.
    Inf,
    /// Serialized per user.
    Queue,
    /// Dropped when one is already running for the user.
    Singleton,
}

fn command_concurrency(command: &str) -> Concurrency {
    match command {
        "delete" | "pin" | "unpin" => Concurrency::Queue,
        "setmask" => Concurrency::Singleton,
        _ => Concurrency::Inf,
    }
}

impl Relay {
    /// Entry point for every inbound update. Spawned per update; errors are
    /// rendered as ephemeral notices and never crash the relay.
    pub async fn handle_update(&self, update: Update) {
        let chat_id = update.message().chat_id;
        let result = match &update {
            Update::EditedMessage(msg) => self.on_edit_message(msg).await,
            Update::Message(msg) => match msg.command() {
                Some((command, arg)) => {
                    let arg = arg.map(str::to_string);
                    self.dispatch_command(msg, command, arg.as_deref()).await
                }
                None => self.on_message(msg).await,
            },
        };
        if let Err(e) = result {
            self.report_error(chat_id, e).await;
        }
    }

    async fn dispatch_command(
        &self,
        msg: &InboundMessage,
        command: &str,
        arg: Option<&str>,
    ) -> OpResult<()> {
        match command_concurrency(command) {
            Concurrency::Inf => self.run_command(msg, command, arg).await,
            Concurrency::Queue => {
                let lock = self.user_lock(msg.from.id).await;
                let _guard = lock.lock().await;
                self.run_command(msg, command, arg).await
            }
            Concurrency::Singleton => {
                let lock = self.user_lock(msg.from.id).await;
                match lock.try_lock() {
                    Ok(_guard) => self.run_command(msg, command, arg).await,
                    Err(_) => Ok(()),
                }
            }
        }
    }

    async fn run_command(
        &self,
        msg: &InboundMessage,
        command: &str,
        arg: Option<&str>,
    ) -> OpResult<()> {
        match command {
            "start" => self.on_start(msg, arg).await,
            "delete" => self.on_delete(msg).await,
            "change" => self.on_change(msg).await,
            "setmask" => self.on_setmask(msg).await,
            "invite" => self.on_invite(msg, arg).await,
            "leave" => self.on_leave(msg).await,
            "ban" => self.on_ban(msg, arg).await,
            "unban" => self.on_unban(msg, arg).await,
            "pin" => self.on_pin(msg).await,
            "unpin" => self.on_unpin(msg).await,
            "reveal" => self.on_reveal(msg).await,
            "manage" => self.on_manage(msg).await,
            "pm" => self.on_pm(msg, arg).await,
            "setwelcome" => self.on_set_welcome(msg).await,
            "setbuttons" => self.on_set_welcome_buttons(msg).await,
            "setinstruction" => self.on_set_instruction(msg).await,
            "setpassword" => self.on_set_password(msg).await,
            "welcomehistory" => self.on_welcome_history(msg, arg).await,
            _ => self.on_unknown(msg).await,
        }
    }

    /// Pre-handler guard: touch the group, clear any stale conversation,
    /// refuse disabled groups. Used by handlers that work on users rather
    /// than members.
    pub(crate) async fn gate(
        &self,
        msg: &InboundMessage,
        conversation_aware: bool,
    ) -> OpResult<GroupRow> {
        let group = self.group().await?;
        self.db.groups().touch(group.id).await?;
        if !conversation_aware {
            self.conversations.set(msg.chat_id, msg.from.id, None);
        }
        if group.disabled {
            return Err(OperationError::Invalid(
                "this group has been deleted and can no longer be used".to_string(),
            ));
        }
        Ok(group)
    }

    /// [`Self::gate`] plus member resolution, role validation and an
    /// activity touch.
    pub(crate) async fn gate_member(
        &self,
        msg: &InboundMessage,
        req: MemberRole,
        conversation_aware: bool,
    ) -> OpResult<(GroupRow, MemberRow)> {
        let group = self.gate(msg, conversation_aware).await?;
        let user = self.db.users().get_or_create(&msg.from).await?;
        let member = self
            .db
            .members()
            .find(group.id, user.id)
            .await?
            .ok_or_else(|| OperationError::Invalid("you are not in this group".to_string()))?;
        member.require(req)?;
        self.db.members().touch(member.id).await?;
        Ok((group, member))
    }

    /// Render an operation failure to the offending chat. The relay's own
    /// credential dying is the one failure that kills the relay.
    pub(crate) async fn report_error(&self, chat_id: i64, err: OperationError) {
        match &err {
            OperationError::Rpc(SdkError::UserDeactivated) => {
                if let Some(group_id) = self.group_id.get() {
                    let _ = self.db.groups().set_disabled(*group_id, true).await;
                }
                info!(relay = %self.name, "Group disabled because its credential was deactivated");
                self.failed.fire();
            }
            OperationError::Rpc(SdkError::MessageNotModified) => {}
            OperationError::Storage | OperationError::Rpc(_) => {
                warn!(relay = %self.name, error_code = err.error_code(), error = %err, "Handler error");
                self.notify_temp(chat_id, "⚠️ An error occurred.".to_string(), 5);
            }
            _ => {
                self.notify_temp(chat_id, format!("⚠️ Failed: {}.", err.notice()), 5);
            }
        }
    }

    async fn on_unknown(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        self.notify_temp(msg.chat_id, "⚠️ Unknown command.".to_string(), 5);
        Ok(())
    }
}
