//! Join flow: `/start`, invite redemption, welcome messages and history
//! replay.

use super::{ConvStatus, Conversation, Relay};
use crate::db::models::{BanType, GroupRow, MemberRole, MemberRow, UserRow};
use crate::error::{OpResult, OperationError};
use crate::worker::{OpState, Operation};
use relay_sdk::{ButtonGrid, InboundMessage, InlineButton};

/// How many recent messages a welcome replay delivers.
const WELCOME_HISTORY: i64 = 10;

impl Relay {
    pub(crate) async fn on_start(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let group = self.gate(msg, false).await?;
        let user = self.db.users().get_or_create(&msg.from).await?;

        if let Some(code) = arg.and_then(|a| a.strip_prefix("_c_")) {
            return self.redeem_invite(msg, &group, &user, code).await;
        }

        match self.db.members().find(group.id, user.id).await? {
            Some(member) if member.role == MemberRole::Left => {
                self.db.members().set_role(member.id, MemberRole::Guest).await?;
                self.send_welcome(&group, &user).await?;
                self.replay_history(&group, member.id).await?;
            }
            Some(member) => {
                self.send_status_panel(msg.chat_id, &group, &member).await?;
            }
            None => {
                if group.private && group.password.is_some() {
                    let prompt = self
                        .notify(msg.chat_id, "🔑 This group is private. Send the password to join:")
                        .await?;
                    self.conversations.set(
                        msg.chat_id,
                        msg.from.id,
                        Some(Conversation::with_prompt(ConvStatus::GpPassword, prompt)),
                    );
                    self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::GpPassword, prompt);
                    return Ok(());
                }
                self.join(&group, &user).await?;
            }
        }
        Ok(())
    }

    /// Create the GUEST member, greet them, replay history when enabled.
    pub(crate) async fn join(&self, group: &GroupRow, user: &UserRow) -> OpResult<MemberRow> {
        let member = self
            .db
            .members()
            .create(group.id, user.id, MemberRole::Guest)
            .await?;
        self.send_welcome(group, user).await?;
        self.replay_history(group, member.id).await?;
        Ok(member)
    }

    async fn redeem_invite(
        &self,
        msg: &InboundMessage,
        group: &GroupRow,
        user: &UserRow,
        code: &str,
    ) -> OpResult<()> {
        let invite = self
            .invites
            .peek(code)
            .await
            .map_err(|_| OperationError::Storage)?
            .ok_or_else(|| OperationError::Invalid("invalid or expired invite link".to_string()))?;
        let inviter = self
            .db
            .members()
            .by_id(invite.member_id)
            .await?
            .ok_or_else(|| OperationError::Invalid("invalid or expired invite link".to_string()))?;
        if self
            .db
            .members()
            .check_ban_quiet(&inviter, group, BanType::Invite, true)
            .await?
        {
            return Err(OperationError::Invalid(
                "invalid or expired invite link".to_string(),
            ));
        }

        let member = match self.db.members().find(group.id, user.id).await? {
            Some(member) if member.role == MemberRole::Left => {
                self.db.members().set_role(member.id, MemberRole::Guest).await?;
                self.send_welcome(group, user).await?;
                self.replay_history(group, member.id).await?;
                member
            }
            Some(member) => {
                self.send_status_panel(msg.chat_id, group, &member).await?;
                return Ok(());
            }
            None => {
                if self
                    .invites
                    .redeem(code)
                    .await
                    .map_err(|_| OperationError::Storage)?
                    .is_none()
                {
                    return Err(OperationError::Invalid(
                        "this invite link has been used up".to_string(),
                    ));
                }
                self.join(group, user).await?
            }
        };
        self.db.members().set_invitor(member.id, inviter.id).await?;
        Ok(())
    }

    async fn send_status_panel(
        &self,
        chat_id: i64,
        group: &GroupRow,
        member: &MemberRow,
    ) -> OpResult<()> {
        let mask = match &member.pinned_mask {
            Some(pinned) => Some(pinned.clone()),
            None => self.masks.mask_for(member.id).await,
        };
        let n_members = self.db.groups().n_members(group.id).await?;
        let mut panel = format!(
            "🌈 Group status:\n\n\
             Members: {n_members}\n\n\
             👤 Your membership:\n\n\
             Role: {}\n\
             Mask: {}\n",
            member.role.display(),
            mask.as_deref().unwrap_or("<inactive>"),
        );
        if member.has(MemberRole::Admin) {
            let status = self.status.snapshot().await;
            let delay = status
                .mean_delay()
                .map(|d| format!("{d:.1}s"))
                .unwrap_or_else(|| "no data".to_string());
            panel.push_str(&format!(
                "\n📣 Fan-out: {} requests, {} errors, mean delay {delay}\n",
                status.requests, status.errors
            ));
        }
        panel.push_str("\n👁️‍🗨️ Only you can see this panel.");
        self.notify(chat_id, &panel).await?;
        Ok(())
    }

    /// Render and send the group's welcome message.
    pub(crate) async fn send_welcome(&self, group: &GroupRow, user: &UserRow) -> OpResult<()> {
        let body = match &group.welcome_message {
            Some(template) => render_welcome(template, user),
            None => format!(
                "🌈 Welcome to the anonymous group {}!\n\n\
                 Every message you send here is forwarded to all members with \
                 your identity hidden behind an emoji mask.\n\
                 Only admins can see who is behind a mask.\n\
                 Enjoy the masquerade!",
                group.title.as_deref().unwrap_or(&group.username),
            ),
        };
        let markup = group
            .welcome_buttons
            .as_deref()
            .and_then(|spec| parse_button_grid(spec).ok());

        match &group.welcome_photo {
            Some(photo) => {
                self.client
                    .send_photo(user.uid, photo, Some(&body), markup.as_ref())
                    .await?;
            }
            None => {
                self.client
                    .send_message(user.uid, &body, markup.as_ref(), None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Enqueue the catch-up replay for a joining member: recent history and
    /// current pins, when the group opted in.
    pub(crate) async fn replay_history(&self, group: &GroupRow, member_id: i64) -> OpResult<()> {
        if !group.welcome_latest {
            return Ok(());
        }
        let recent: Vec<i64> = self
            .db
            .messages()
            .recent(group.id, WELCOME_HISTORY)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        let pinned: Vec<i64> = self
            .db
            .messages()
            .pinned(group.id)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();

        if !recent.is_empty() {
            self.queue
                .put(Operation::BulkRedirect {
                    message_ids: recent,
                    member_id,
                    state: OpState::new(),
                })
                .await
                .map_err(|_| OperationError::Storage)?;
        }
        if !pinned.is_empty() {
            self.queue
                .put(Operation::BulkPin {
                    message_ids: pinned,
                    member_id,
                    state: OpState::new(),
                })
                .await
                .map_err(|_| OperationError::Storage)?;
        }
        Ok(())
    }

    /// Password attempt on a private group.
    pub(crate) async fn conv_join_password(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        if let Some(prompt) = conversation.prompt_mid {
            let _ = self.client.delete_messages(msg.chat_id, &[prompt]).await;
        }
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let group = self.group().await?;
        let user = self.db.users().get_or_create(&msg.from).await?;

        let attempt = msg.text.as_deref().unwrap_or_default();
        if group.password.as_deref() != Some(attempt) {
            self.notify_temp(msg.chat_id, "⚠️ Wrong password.".to_string(), 5);
            return Ok(());
        }
        if self.db.members().find(group.id, user.id).await?.is_none() {
            self.join(&group, &user).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_leave(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (_, member) = self.gate_member(msg, MemberRole::Guest, false).await?;
        if member.role == MemberRole::Creator {
            return Err(OperationError::Invalid(
                "the creator of the group cannot leave".to_string(),
            ));
        }
        self.db.members().set_role(member.id, MemberRole::Left).await?;
        self.notify_temp(
            msg.chat_id,
            "✅ You left the group and will no longer receive messages.".to_string(),
            5,
        );
        Ok(())
    }
}

/// Fill the welcome-template placeholders.
fn render_welcome(template: &str, user: &UserRow) -> String {
    template
        .replace("{name}", &user.name())
        .replace("{masked_name}", &user.masked_name())
        .replace("{first_name}", user.first_name.as_deref().unwrap_or(""))
        .replace("{last_name}", user.last_name.as_deref().unwrap_or(""))
}

/// Parse a button grid spec: one row per line, buttons separated by `|`,
/// each `display : url`.
pub(crate) fn parse_button_grid(spec: &str) -> Result<ButtonGrid, OperationError> {
    let mut rows = Vec::new();
    for line in spec.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for button in line.split('|') {
            let (text, url) = button.split_once(':').ok_or_else(|| {
                OperationError::Invalid("button format is `text : url`".to_string())
            })?;
            row.push(InlineButton {
                text: text.trim().to_string(),
                url: url.trim().to_string(),
            });
        }
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(OperationError::Invalid("no buttons in the spec".to_string()));
    }
    Ok(ButtonGrid { rows })
}
