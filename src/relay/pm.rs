//! The PM tunnel: private replies between members, relayed through the bot
//! with the sender masked.

use super::Relay;
use super::commands::ReplyTarget;
use crate::db::models::{BanType, GroupRow, MemberRole, MemberRow, PmMessageRow};
use crate::error::{OpResult, OperationError};
use relay_sdk::{CopyRequest, InboundMessage};

impl Relay {
    /// `/pm <text>`: message the author of the replied-to message privately.
    pub(crate) async fn on_pm(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        let Some(content) = arg else {
            self.delete_inbound(msg.chat_id, msg.mid).await;
            self.notify_temp(
                msg.chat_id,
                "⚠️ Use \"/pm [text]\" on a reply to send a private message.".to_string(),
                5,
            );
            return Ok(());
        };
        let (group, member) = self.gate_member(msg, MemberRole::Member, false).await?;

        let target = match self.reply_target(msg, &member, true).await? {
            ReplyTarget::Broadcast(record) => self
                .db
                .members()
                .by_id(record.member_id)
                .await?
                .ok_or_else(|| OperationError::Invalid("member is no longer in the group".to_string()))?,
            ReplyTarget::Pm(pm) => self.pm_counterparty(&pm).await?,
        };

        self.send_pm(msg, &group, &member, &target, content).await
    }

    /// A plain reply landing on a tunneled PM continues the tunnel.
    pub(crate) async fn pm_tunnel_reply(
        &self,
        msg: &InboundMessage,
        group: &GroupRow,
        member: &MemberRow,
        _mask: &str,
        pm: PmMessageRow,
    ) -> OpResult<()> {
        let target = self.pm_counterparty(&pm).await?;
        let content = msg.content().unwrap_or_default().to_string();
        self.send_pm(msg, group, member, &target, &content).await
    }

    async fn pm_counterparty(&self, pm: &PmMessageRow) -> OpResult<MemberRow> {
        let from = pm
            .from_member_id
            .ok_or_else(|| OperationError::Invalid("this member has left the group".to_string()))?;
        self.db
            .members()
            .by_id(from)
            .await?
            .ok_or_else(|| OperationError::Invalid("this member has left the group".to_string()))
    }

    async fn send_pm(
        &self,
        msg: &InboundMessage,
        group: &GroupRow,
        member: &MemberRow,
        target: &MemberRow,
        content: &str,
    ) -> OpResult<()> {
        let members = self.db.members();
        members.check_ban(member, group, BanType::PmUser, true).await?;
        if target.role >= MemberRole::Admin {
            members.check_ban(member, group, BanType::PmAdmin, true).await?;
        }
        if target.role <= MemberRole::Left {
            return Err(OperationError::Invalid(
                "member is no longer in the group".to_string(),
            ));
        }
        if members
            .check_ban_quiet(target, group, BanType::Receive, false)
            .await?
        {
            return Err(OperationError::Invalid(
                "this member cannot receive messages".to_string(),
            ));
        }
        if self.db.messages().pm_ban_exists(member.id, target.id).await? {
            return Err(OperationError::Invalid(
                "this member does not want private messages from you".to_string(),
            ));
        }
        self.admissible(member, group, msg).await?;

        let (created, mask) = match &member.pinned_mask {
            Some(pinned) => (false, pinned.clone()),
            None => self.masks.get_mask(member.id, false).await?,
        };
        let body = format!("{mask} (👁️ PM) | {content}");

        let sending = if created {
            format!("🔃 Sending the private message as {mask} ...")
        } else {
            "🔃 Sending the private message ...".to_string()
        };
        let notice = self.notify(msg.chat_id, &sending).await.ok();

        let target_user = self
            .db
            .users()
            .by_id(target.user_id)
            .await?
            .ok_or(OperationError::Storage)?;
        let result = self
            .client
            .copy_message(&CopyRequest {
                to_chat: target_user.uid,
                from_chat: msg.chat_id,
                mid: msg.mid,
                text: msg.text.as_ref().map(|_| body.clone()),
                caption: msg.text.is_none().then(|| body.clone()),
                entities: Vec::new(),
                reply_to_mid: None,
            })
            .await;

        match result {
            Ok(delivered_mid) => {
                self.db
                    .messages()
                    .create_pm(member.id, target.id, msg.mid, delivered_mid)
                    .await?;
                if let Some(mid) = notice {
                    let _ = self
                        .client
                        .edit_message_text(msg.chat_id, mid, "✅ Private message sent.")
                        .await;
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    let _ = self.client.delete_messages(msg.chat_id, &[mid]).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(mid) = notice {
                    let _ = self
                        .client
                        .edit_message_text(msg.chat_id, mid, "⚠️ Sending failed.")
                        .await;
                    let _ = self.client.delete_messages(msg.chat_id, &[mid]).await;
                }
                Err(e.into())
            }
        }
    }
}
