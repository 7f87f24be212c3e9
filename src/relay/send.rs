//! The send path: non-command text/media becomes a broadcast.

use super::{ConvStatus, Conversation, Relay};
use crate::db::models::{BanType, GroupRow, MemberRole, MemberRow};
use crate::error::{OpResult, OperationError};
use crate::worker::{OpState, Operation, Signal};
use relay_sdk::{InboundMessage, MediaKind};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

/// URL detection for the LINK content check, applied to the body besides
/// the entity scan.
static URL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?:https?://|www\.)[a-zA-Z0-9][a-zA-Z0-9.-]*\.[^\s]{2,}")
        .expect("url regex")
});

/// How long a guest gets to acknowledge the chat instruction.
const INSTRUCTION_CONFIRM_SECS: u64 = 120;

impl Relay {
    pub(crate) async fn on_message(&self, msg: &InboundMessage) -> OpResult<()> {
        // A parked conversation consumes the message.
        if let Some(conversation) = self.conversations.take(msg.chat_id, msg.from.id) {
            return self.handle_conversation(msg, conversation).await;
        }

        let group = self.group().await?;
        self.db.groups().touch(group.id).await?;
        if group.disabled {
            return Err(OperationError::Invalid(
                "this group has been deleted and can no longer be used".to_string(),
            ));
        }

        let user = self.db.users().get_or_create(&msg.from).await?;
        let Some(mut member) = self.db.members().find(group.id, user.id).await? else {
            self.delete_inbound(msg.chat_id, msg.mid).await;
            return Err(OperationError::Invalid(
                "you are not in this group, use /start to join".to_string(),
            ));
        };

        if let Err(e) = self.admissible(&member, &group, msg).await {
            self.notify_temp(
                msg.chat_id,
                format!("⚠️ Sorry, {}, and the message will be deleted soon.", e.notice()),
                30,
            );
            self.delete_inbound(msg.chat_id, msg.mid).await;
            return Ok(());
        }

        // Guests confirm the chat instruction before their first send.
        if member.role == MemberRole::Guest {
            if let Some(instruction) = group.chat_instruction.clone() {
                if !self.confirm_instruction(msg, &instruction).await? {
                    self.delete_inbound(msg.chat_id, msg.mid).await;
                    return Ok(());
                }
            }
            self.db.members().set_role(member.id, MemberRole::Member).await?;
            member.role = MemberRole::Member;
        }

        let (created, mask) = match &member.pinned_mask {
            Some(pinned) => (false, pinned.clone()),
            None => self.masks.get_mask(member.id, false).await?,
        };

        // Reply target resolution: own message, then a redirect of someone
        // else's, then the PM tunnel (which diverts the whole send).
        let mut reply_to_id = None;
        if let Some(replied) = msg.reply_to_mid {
            if let Some(own) = self
                .db
                .messages()
                .find_by_mid_member(replied, member.id)
                .await?
            {
                reply_to_id = Some(own.id);
            } else if let Some(source) = self.db.messages().reverse(replied, member.id).await? {
                reply_to_id = Some(source.id);
            } else if let Some(pm) = self.db.messages().pm_reverse(replied, member.id).await? {
                return self.pm_tunnel_reply(msg, &group, &member, &mask, pm).await;
            }
        }

        let record = self
            .db
            .messages()
            .create(group.id, msg.mid, member.id, &mask, reply_to_id)
            .await?;
        self.db.members().set_last_mask(member.id, &mask).await?;

        let state = OpState::new();
        self.queue
            .put(Operation::Broadcast {
                source: msg.clone(),
                sender_member_id: member.id,
                message_id: record.id,
                state: Arc::clone(&state),
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Queue write failed");
                OperationError::Storage
            })?;

        let sending = if created {
            format!("🔃 Sending as {mask} ...")
        } else {
            "🔃 Sending ...".to_string()
        };
        self.track_operation(msg.chat_id, &state, &sending, "✅ Sent", "⚠️ Timed out broadcasting the message")
            .await
    }

    /// Poll an operation's completion signal every second for
    /// `30 + 5 * n_members` iterations, refreshing the notice every 10.
    pub(crate) async fn track_operation(
        &self,
        chat_id: i64,
        state: &OpState,
        sending_text: &str,
        done_text: &str,
        timeout_text: &str,
    ) -> OpResult<()> {
        let notice = self.notify(chat_id, sending_text).await.ok();
        let n_members = self.db.groups().n_members(self.group_id()?).await?;
        let iterations = 30 + 5 * n_members;

        let mut completed = false;
        for i in 0..iterations {
            if tokio::time::timeout(Duration::from_secs(1), state.finished.wait())
                .await
                .is_ok()
            {
                completed = true;
                break;
            }
            if i > 0 && i % 10 == 0 && let Some(mid) = notice {
                let (requests, _) = state.counts();
                let _ = self
                    .client
                    .edit_message_text(
                        chat_id,
                        mid,
                        &format!("{sending_text} ({requests}/{n_members})"),
                    )
                    .await;
            }
        }

        if let Some(mid) = notice {
            let (requests, errors) = state.counts();
            let text = if completed {
                format!("{done_text} ({}/{requests}).", requests - errors)
            } else {
                format!("{timeout_text}.")
            };
            let _ = self.client.edit_message_text(chat_id, mid, &text).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = self.client.delete_messages(chat_id, &[mid]).await;
        }
        Ok(())
    }

    /// Content checks against the member's current bans.
    pub(crate) async fn admissible(
        &self,
        member: &MemberRow,
        group: &GroupRow,
        msg: &InboundMessage,
    ) -> OpResult<()> {
        member.require_above(MemberRole::Left)?;
        let members = self.db.members();
        members.check_ban(member, group, BanType::Message, true).await?;
        if msg.media.is_some() {
            members.check_ban(member, group, BanType::Media, true).await?;
        }
        if msg
            .media
            .as_ref()
            .is_some_and(|m| m.kind == MediaKind::Sticker)
        {
            members.check_ban(member, group, BanType::Sticker, true).await?;
        }
        if msg.has_markup {
            members.check_ban(member, group, BanType::Markup, true).await?;
        }
        if msg.entities.iter().any(|e| e.kind.is_link()) {
            members.check_ban(member, group, BanType::Link, true).await?;
        }
        if let Some(content) = msg.content() {
            if content.chars().count() > 200 {
                members.check_ban(member, group, BanType::Long, true).await?;
            }
            if URL_RE.is_match(content) {
                members.check_ban(member, group, BanType::Link, true).await?;
            }
        }
        Ok(())
    }

    /// Present the chat instruction and wait for acknowledgement. Returns
    /// whether the send may proceed; on timeout the message is dropped
    /// silently.
    async fn confirm_instruction(
        &self,
        msg: &InboundMessage,
        instruction: &str,
    ) -> OpResult<bool> {
        let confirm = Signal::new();
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation {
                status: ConvStatus::CiConfirm,
                prompt_mid: None,
                confirm: Some(Arc::clone(&confirm)),
            }),
        );
        let prompt = self
            .notify(
                msg.chat_id,
                &format!("ℹ️ {instruction}\n\nSend any message to acknowledge."),
            )
            .await
            .ok();

        let acknowledged = tokio::time::timeout(
            Duration::from_secs(INSTRUCTION_CONFIRM_SECS),
            confirm.wait(),
        )
        .await
        .is_ok();

        if let Some(mid) = prompt {
            let _ = self.client.delete_messages(msg.chat_id, &[mid]).await;
        }
        if !acknowledged {
            self.conversations.set(msg.chat_id, msg.from.id, None);
            debug!(relay = %self.name, "Instruction acknowledgement timed out");
        }
        Ok(acknowledged)
    }

    pub(crate) async fn on_edit_message(&self, msg: &InboundMessage) -> OpResult<()> {
        let group = self.group().await?;
        if group.disabled {
            return Ok(());
        }
        let user = self.db.users().get_or_create(&msg.from).await?;
        let Some(member) = self.db.members().find(group.id, user.id).await? else {
            return Ok(());
        };
        let Some(record) = self
            .db
            .messages()
            .find_by_mid_member(msg.mid, member.id)
            .await?
        else {
            return Ok(());
        };

        let state = OpState::new();
        self.queue
            .put(Operation::Edit {
                source: msg.clone(),
                sender_member_id: member.id,
                message_id: record.id,
                state: Arc::clone(&state),
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Queue write failed");
                OperationError::Storage
            })?;
        let _ = tokio::time::timeout(Duration::from_secs(120), state.finished.wait()).await;
        Ok(())
    }

    /// Route a consumed conversation to its handler.
    async fn handle_conversation(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        match conversation.status {
            ConvStatus::CiConfirm => {
                if let Some(confirm) = &conversation.confirm {
                    confirm.fire();
                }
                self.delete_inbound(msg.chat_id, msg.mid).await;
                Ok(())
            }
            ConvStatus::SmMask => self.conv_set_mask(msg, conversation).await,
            ConvStatus::EwmmMessage => self.conv_welcome_message(msg, conversation).await,
            ConvStatus::EwmmButton => self.conv_welcome_buttons(msg, conversation).await,
            ConvStatus::EciInstruction => self.conv_instruction(msg, conversation).await,
            ConvStatus::EpPassword => self.conv_set_password(msg, conversation).await,
            ConvStatus::GpPassword => self.conv_join_password(msg, conversation).await,
            // Father-side statuses never occur on a group relay.
            ConvStatus::UseCode | ConvStatus::NgToken => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_regex_matches_bare_and_schemed_urls() {
        assert!(URL_RE.is_match("see https://example.com/x"));
        assert!(URL_RE.is_match("go to www.example.org now"));
        assert!(!URL_RE.is_match("no links here"));
        assert!(!URL_RE.is_match("v1.2 release notes"));
    }
}
