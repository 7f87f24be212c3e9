//! Member-facing commands: delete, mask changes, moderation, reveal.

use super::{ConvStatus, Conversation, Relay};
use crate::db::models::{BanType, MemberRole, MemberRow, MessageRow, PmMessageRow};
use crate::error::{OpResult, OperationError};
use crate::worker::{OpState, Operation};
use chrono::{DateTime, Utc};
use relay_sdk::InboundMessage;
use std::sync::Arc;
use std::time::Duration;

/// What a replied-to message resolves to.
pub(crate) enum ReplyTarget {
    Broadcast(MessageRow),
    Pm(PmMessageRow),
}

impl Relay {
    /// Resolve the message a command replies to: the member's own record,
    /// then a redirect delivered to them, then (optionally) the PM tunnel.
    pub(crate) async fn reply_target(
        &self,
        msg: &InboundMessage,
        member: &MemberRow,
        allow_pm: bool,
    ) -> OpResult<ReplyTarget> {
        let replied = msg
            .reply_to_mid
            .ok_or_else(|| OperationError::Invalid("reply to a message to use this".to_string()))?;
        if let Some(own) = self
            .db
            .messages()
            .find_by_mid_member(replied, member.id)
            .await?
        {
            return Ok(ReplyTarget::Broadcast(own));
        }
        if let Some(source) = self.db.messages().reverse(replied, member.id).await? {
            return Ok(ReplyTarget::Broadcast(source));
        }
        if allow_pm
            && let Some(pm) = self.db.messages().pm_reverse(replied, member.id).await?
        {
            return Ok(ReplyTarget::Pm(pm));
        }
        Err(OperationError::Invalid(
            "this is not an anonymous message or it has expired".to_string(),
        ))
    }

    pub(crate) async fn on_delete(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (group, member) = self.gate_member(msg, MemberRole::Member, false).await?;
        let ReplyTarget::Broadcast(record) = self.reply_target(msg, &member, false).await? else {
            unreachable!()
        };
        self.db
            .members()
            .check_ban(&member, &group, BanType::Message, true)
            .await?;
        if record.member_id != member.id && !member.has(MemberRole::AdminBan) {
            self.notify_temp(
                msg.chat_id,
                "⚠️ You can only delete messages you sent.".to_string(),
                5,
            );
            return Ok(());
        }

        let state = OpState::new();
        self.queue
            .put(Operation::Delete {
                message_id: record.id,
                state: Arc::clone(&state),
            })
            .await
            .map_err(|_| OperationError::Storage)?;
        self.track_operation(
            msg.chat_id,
            &state,
            "🔃 Deleting the message ...",
            "🗑️ Message deleted",
            "⚠️ Timed out deleting the message",
        )
        .await
    }

    pub(crate) async fn on_change(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::Member, false).await?;
        let (_, mask) = self.masks.get_mask(member.id, true).await?;
        self.notify_temp(msg.chat_id, format!("🌈 Your mask is now: {mask}"), 5);
        Ok(())
    }

    pub(crate) async fn on_setmask(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::Member, false).await?;
        if !member.has(MemberRole::Admin) && !self.db.users().is_prime(member.user_id).await? {
            self.notify_temp(
                msg.chat_id,
                "⚠️ You need PRIME privileges to pin a mask.".to_string(),
                5,
            );
            return Ok(());
        }
        let prompt = self
            .notify(msg.chat_id, "⬇️ Send the emojis to use as your mask:")
            .await?;
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::with_prompt(ConvStatus::SmMask, prompt)),
        );
        self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::SmMask, prompt);
        Ok(())
    }

    /// Clear a parked conversation after 120 s if it is still pending.
    pub(crate) fn expire_conversation(
        &self,
        chat_id: i64,
        user_id: i64,
        status: ConvStatus,
        prompt_mid: i64,
    ) {
        let client = Arc::clone(&self.client);
        let conversations = self.conversations.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            if conversations.status_of(chat_id, user_id) == Some(status) {
                conversations.set(chat_id, user_id, None);
                let _ = client.delete_messages(chat_id, &[prompt_mid]).await;
                if let Ok(mid) = client
                    .send_message(chat_id, "⚠️ Conversation timed out.", None, None)
                    .await
                {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let _ = client.delete_messages(chat_id, &[mid]).await;
                }
            }
        });
    }

    /// Resolve the target of a moderation command: explicit uid argument, or
    /// the author of the replied-to message. Replies into the PM tunnel are
    /// handled by the caller.
    async fn moderation_target(
        &self,
        msg: &InboundMessage,
        member: &MemberRow,
        arg: Option<&str>,
    ) -> OpResult<Result<MemberRow, PmMessageRow>> {
        if let Some(arg) = arg {
            let peer = self.client.get_users(arg).await?;
            let user = self
                .db
                .users()
                .by_uid(peer.id)
                .await?
                .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?;
            let target = self
                .db
                .members()
                .find(member.group_id, user.id)
                .await?
                .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?;
            return Ok(Ok(target));
        }
        match self.reply_target(msg, member, true).await? {
            ReplyTarget::Broadcast(record) => {
                let target = self
                    .db
                    .members()
                    .by_id(record.member_id)
                    .await?
                    .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?;
                Ok(Ok(target))
            }
            ReplyTarget::Pm(pm) => Ok(Err(pm)),
        }
    }

    /// The role ladder shared by ban and unban.
    fn check_moderation_ladder(member: &MemberRow, target: &MemberRow) -> OpResult<()> {
        member.require(MemberRole::AdminBan)?;
        if target.role >= MemberRole::Admin {
            member.require(MemberRole::AdminAdmin)?;
        }
        if target.role >= MemberRole::AdminAdmin {
            member.require(MemberRole::Creator)?;
        }
        if target.id == member.id {
            return Err(OperationError::Invalid("you cannot moderate yourself".to_string()));
        }
        if target.role >= member.role {
            return Err(OperationError::Invalid(
                "your role is below the target's role".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn on_ban(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::Guest, false).await?;
        let target = match self.moderation_target(msg, &member, arg).await? {
            Ok(target) => target,
            Err(pm) => {
                // Banning a PM sender suppresses their PMs to this member.
                if let Some(from) = pm.from_member_id
                    && !self.db.messages().pm_ban_exists(from, member.id).await?
                {
                    self.db.messages().create_pm_ban(from, member.id).await?;
                }
                self.notify_temp(
                    msg.chat_id,
                    "✅ Private messages from this member will be suppressed.".to_string(),
                    5,
                );
                return Ok(());
            }
        };
        Self::check_moderation_ladder(&member, &target)?;
        if target.role == MemberRole::Banned {
            self.notify_temp(msg.chat_id, "⚠️ This member is already banned.".to_string(), 5);
            return Ok(());
        }
        self.db.members().set_role(target.id, MemberRole::Banned).await?;
        self.notify_temp(msg.chat_id, "🚫 Member banned.".to_string(), 5);
        Ok(())
    }

    pub(crate) async fn on_unban(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::Guest, false).await?;
        let target = match self.moderation_target(msg, &member, arg).await? {
            Ok(target) => target,
            Err(pm) => {
                if let Some(from) = pm.from_member_id {
                    self.db.messages().delete_pm_ban(from, member.id).await?;
                }
                self.notify_temp(
                    msg.chat_id,
                    "✅ This member can message you privately again.".to_string(),
                    5,
                );
                return Ok(());
            }
        };
        Self::check_moderation_ladder(&member, &target)?;
        if target.role != MemberRole::Banned {
            self.notify_temp(msg.chat_id, "⚠️ This member is not banned.".to_string(), 5);
            return Ok(());
        }
        self.db.members().set_role(target.id, MemberRole::Guest).await?;
        self.notify_temp(msg.chat_id, "✅ Member unbanned.".to_string(), 5);
        Ok(())
    }

    pub(crate) async fn on_pin(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (group, member) = self.gate_member(msg, MemberRole::AdminMsg, false).await?;
        self.require_prime_pin(&group, member.user_id).await?;
        let ReplyTarget::Broadcast(record) = self.reply_target(msg, &member, false).await? else {
            unreachable!()
        };
        self.db.messages().set_pinned(record.id, true).await?;

        let state = OpState::new();
        self.queue
            .put(Operation::Pin {
                message_id: record.id,
                state: Arc::clone(&state),
            })
            .await
            .map_err(|_| OperationError::Storage)?;
        self.track_operation(
            msg.chat_id,
            &state,
            "🔃 Pinning the message ...",
            "📌 Message pinned",
            "⚠️ Timed out pinning the message",
        )
        .await
    }

    pub(crate) async fn on_unpin(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (group, member) = self.gate_member(msg, MemberRole::AdminMsg, false).await?;
        self.require_prime_pin(&group, member.user_id).await?;
        let ReplyTarget::Broadcast(record) = self.reply_target(msg, &member, false).await? else {
            unreachable!()
        };
        self.db.messages().set_pinned(record.id, false).await?;

        let state = OpState::new();
        self.queue
            .put(Operation::Unpin {
                message_id: record.id,
                state: Arc::clone(&state),
            })
            .await
            .map_err(|_| OperationError::Storage)?;
        self.track_operation(
            msg.chat_id,
            &state,
            "🔃 Unpinning the message ...",
            "📌 Message unpinned",
            "⚠️ Timed out unpinning the message",
        )
        .await
    }

    /// Pins require PRIME on the group creator or the acting user.
    async fn require_prime_pin(
        &self,
        group: &crate::db::models::GroupRow,
        user_id: i64,
    ) -> OpResult<()> {
        let users = self.db.users();
        if users.is_prime(group.creator_id).await? || users.is_prime(user_id).await? {
            Ok(())
        } else {
            Err(OperationError::Invalid(
                "pinning requires PRIME privileges".to_string(),
            ))
        }
    }

    pub(crate) async fn on_reveal(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::AdminBan, false).await?;
        let ReplyTarget::Broadcast(record) = self.reply_target(msg, &member, false).await? else {
            unreachable!()
        };
        let target = self
            .db
            .members()
            .by_id(record.member_id)
            .await?
            .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?;
        let user = self
            .db
            .users()
            .by_id(target.user_id)
            .await?
            .ok_or(OperationError::Storage)?;

        let joined = format_day(target.created_at);
        let active = format_day(target.last_activity);
        let n_messages = self.db.members().n_messages(target.id).await?;
        let card = format!(
            "ℹ️ Member info:\n\n\
             Name: {}\n\
             ID: {}\n\
             Role: {}\n\
             Joined: {joined}\n\
             Messages: {n_messages}\n\
             Last active: {active}\n\
             Last mask: {}\n\n\
             👁️‍🗨️ Only you can see this panel.",
            user.name(),
            user.uid,
            target.role.display(),
            target.last_mask.as_deref().unwrap_or("<none>"),
        );
        self.notify_temp(msg.chat_id, card, 15);
        Ok(())
    }

    /// `/manage` resolves the target for the admin menu (the menu tree is an
    /// external collaborator); the core shows the target's standing.
    pub(crate) async fn on_manage(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::AdminBan, false).await?;
        let ReplyTarget::Broadcast(record) = self.reply_target(msg, &member, false).await? else {
            unreachable!()
        };
        let target = self
            .db
            .members()
            .by_id(record.member_id)
            .await?
            .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?;
        let bans = self.db.members().member_bans(&target).await?;
        let bans = if bans.is_empty() {
            "none".to_string()
        } else {
            bans.iter()
                .map(|b| b.display())
                .collect::<Vec<_>>()
                .join(", ")
        };
        self.notify_temp(
            msg.chat_id,
            format!(
                "🛠️ Managing member {} (role: {}).\nActive restrictions: {bans}.\n\
                 Use /ban, /unban or the panel to change their standing.",
                target.id,
                target.role.display()
            ),
            15,
        );
        Ok(())
    }

    pub(crate) async fn on_invite(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (group, member) = self.gate_member(msg, MemberRole::Member, false).await?;
        if !group.private {
            return Err(OperationError::Invalid(
                "this group is public, no invite link is needed".to_string(),
            ));
        }
        self.db
            .members()
            .check_ban(&member, &group, BanType::Invite, true)
            .await?;

        // "/invite [uses] [days]"; unlimited uses when `uses` is 0.
        let mut parts = arg.unwrap_or("").split_whitespace();
        let uses = match parts.next().map(str::parse::<u32>) {
            Some(Ok(0)) => None,
            Some(Ok(n)) => Some(n),
            _ => Some(1),
        };
        let ttl = match parts.next().map(str::parse::<u64>) {
            Some(Ok(days)) => Some(Duration::from_secs(days * 86_400)),
            _ => Some(Duration::from_secs(7 * 86_400)),
        };
        let code = self
            .invites
            .issue(member.id, uses, ttl)
            .await
            .map_err(|_| OperationError::Storage)?;
        let username = self
            .profile()
            .map(|p| p.username.clone())
            .unwrap_or_default();
        self.notify(
            msg.chat_id,
            &format!(
                "🔗 Share this invite link with your friends:\n\nhttps://t.me/{username}?start=_c_{code}"
            ),
        )
        .await?;
        Ok(())
    }
}

fn format_day(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string())
}
