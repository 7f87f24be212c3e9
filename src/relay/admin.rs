//! Admin conversations: welcome message, buttons, chat instruction, group
//! password, and the mask-pinning conversation.
//!
//! The full admin surface is menu-driven (an external collaborator); these
//! commands are the direct entry points into the same conversation statuses.

use super::{ConvStatus, Conversation, Relay};
use crate::db::models::{BanType, MemberRole};
use crate::error::{OpResult, OperationError};
use relay_sdk::InboundMessage;

impl Relay {
    pub(crate) async fn on_set_welcome(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        self.gate_member(msg, MemberRole::AdminMsg, false).await?;
        let prompt = self
            .notify(
                msg.chat_id,
                "⬇️ Send the new welcome message (text, or a photo with caption). \
                 Placeholders: {name}, {masked_name}, {first_name}, {last_name}. \
                 Send `default` to reset.",
            )
            .await?;
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::with_prompt(ConvStatus::EwmmMessage, prompt)),
        );
        self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::EwmmMessage, prompt);
        Ok(())
    }

    pub(crate) async fn on_set_welcome_buttons(
        &self,
        msg: &InboundMessage,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        self.gate_member(msg, MemberRole::AdminMsg, false).await?;
        let prompt = self
            .notify(
                msg.chat_id,
                "⬇️ Send the button spec: one row per line, `display : url` \
                 separated by `|`. Send `default` to clear.",
            )
            .await?;
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::with_prompt(ConvStatus::EwmmButton, prompt)),
        );
        self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::EwmmButton, prompt);
        Ok(())
    }

    pub(crate) async fn on_set_instruction(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        self.gate_member(msg, MemberRole::Admin, false).await?;
        let prompt = self
            .notify(
                msg.chat_id,
                "⬇️ Send the chat instruction new members must acknowledge. \
                 Send `default` to clear.",
            )
            .await?;
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::with_prompt(ConvStatus::EciInstruction, prompt)),
        );
        self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::EciInstruction, prompt);
        Ok(())
    }

    pub(crate) async fn on_set_password(&self, msg: &InboundMessage) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        self.gate_member(msg, MemberRole::Admin, false).await?;
        let prompt = self
            .notify(
                msg.chat_id,
                "⬇️ Send the new join password. Send `default` to make the group public.",
            )
            .await?;
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::with_prompt(ConvStatus::EpPassword, prompt)),
        );
        self.expire_conversation(msg.chat_id, msg.from.id, ConvStatus::EpPassword, prompt);
        Ok(())
    }

    pub(crate) async fn on_welcome_history(
        &self,
        msg: &InboundMessage,
        arg: Option<&str>,
    ) -> OpResult<()> {
        self.delete_inbound(msg.chat_id, msg.mid).await;
        let (group, _) = self.gate_member(msg, MemberRole::AdminMsg, false).await?;
        let enabled = match arg {
            Some("on") => true,
            Some("off") => false,
            _ => {
                return Err(OperationError::Invalid(
                    "use `/welcomehistory on` or `/welcomehistory off`".to_string(),
                ));
            }
        };
        self.db.groups().set_welcome_latest(group.id, enabled).await?;
        self.notify_temp(
            msg.chat_id,
            format!(
                "✅ Joining members will {}receive recent history.",
                if enabled { "" } else { "no longer " }
            ),
            5,
        );
        Ok(())
    }

    // === conversation handlers ===

    async fn finish_conversation(&self, msg: &InboundMessage, conversation: &Conversation) {
        if let Some(prompt) = conversation.prompt_mid {
            let _ = self.client.delete_messages(msg.chat_id, &[prompt]).await;
        }
        self.delete_inbound(msg.chat_id, msg.mid).await;
    }

    pub(crate) async fn conv_welcome_message(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        self.finish_conversation(msg, &conversation).await;
        let (group, _) = self.gate_member(msg, MemberRole::AdminMsg, true).await?;

        let photo = msg.media.as_ref().map(|m| m.file_id.clone());
        let content = msg.content();
        match (content, &photo) {
            (Some("default"), _) => {
                self.db
                    .groups()
                    .set_welcome(group.id, None, None, group.welcome_buttons.as_deref())
                    .await?;
            }
            (Some(text), _) => {
                self.db
                    .groups()
                    .set_welcome(
                        group.id,
                        Some(text),
                        photo.as_deref().or(group.welcome_photo.as_deref()),
                        group.welcome_buttons.as_deref(),
                    )
                    .await?;
            }
            (None, Some(_)) => {
                self.db
                    .groups()
                    .set_welcome(
                        group.id,
                        group.welcome_message.as_deref(),
                        photo.as_deref(),
                        group.welcome_buttons.as_deref(),
                    )
                    .await?;
            }
            (None, None) => {
                self.notify_temp(msg.chat_id, "⚠️ Not a valid message.".to_string(), 5);
                return Ok(());
            }
        }
        self.notify_temp(msg.chat_id, "✅ Welcome message updated.".to_string(), 5);
        Ok(())
    }

    pub(crate) async fn conv_welcome_buttons(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        self.finish_conversation(msg, &conversation).await;
        let (group, _) = self.gate_member(msg, MemberRole::AdminMsg, true).await?;

        let Some(content) = msg.content() else {
            self.notify_temp(msg.chat_id, "⚠️ Not a valid message.".to_string(), 5);
            return Ok(());
        };
        let buttons = if content == "default" {
            None
        } else {
            // Validate the spec before persisting it.
            super::join::parse_button_grid(content)?;
            Some(content)
        };
        self.db
            .groups()
            .set_welcome(
                group.id,
                group.welcome_message.as_deref(),
                group.welcome_photo.as_deref(),
                buttons,
            )
            .await?;
        self.notify_temp(msg.chat_id, "✅ Welcome buttons updated.".to_string(), 5);
        Ok(())
    }

    pub(crate) async fn conv_instruction(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        self.finish_conversation(msg, &conversation).await;
        let (group, _) = self.gate_member(msg, MemberRole::Admin, true).await?;

        let Some(content) = msg.content() else {
            self.notify_temp(msg.chat_id, "⚠️ Not a valid message.".to_string(), 5);
            return Ok(());
        };
        let instruction = (content != "default").then_some(content);
        self.db
            .groups()
            .set_chat_instruction(group.id, instruction)
            .await?;
        self.notify_temp(msg.chat_id, "✅ Chat instruction updated.".to_string(), 5);
        Ok(())
    }

    pub(crate) async fn conv_set_password(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        self.finish_conversation(msg, &conversation).await;
        let (group, _) = self.gate_member(msg, MemberRole::Admin, true).await?;

        let Some(content) = msg.text.as_deref() else {
            self.notify_temp(msg.chat_id, "⚠️ Not a valid message.".to_string(), 5);
            return Ok(());
        };
        let password = (content != "default").then_some(content);
        self.db.groups().set_password(group.id, password).await?;
        self.notify_temp(
            msg.chat_id,
            if password.is_some() {
                "✅ The group is now private with the given password.".to_string()
            } else {
                "✅ The group is now public.".to_string()
            },
            5,
        );
        Ok(())
    }

    /// `sm_mask`: the member sends the emojis to pin as their mask.
    pub(crate) async fn conv_set_mask(
        &self,
        msg: &InboundMessage,
        conversation: Conversation,
    ) -> OpResult<()> {
        self.finish_conversation(msg, &conversation).await;
        let (group, member) = self.gate_member(msg, MemberRole::Member, true).await?;

        let Some(content) = msg.content() else {
            self.notify_temp(msg.chat_id, "⚠️ Not a valid message.".to_string(), 5);
            return Ok(());
        };
        let members = self.db.members();
        members.check_ban(&member, &group, BanType::PinMask, true).await?;

        let mask = extract_emojis(content);
        if mask.is_empty() {
            return Err(OperationError::Invalid(
                "only emojis are acceptable as masks".to_string(),
            ));
        }
        let clusters = mask.len();
        if clusters > 1 {
            members.check_ban(&member, &group, BanType::LongMask1, true).await?;
        }
        if clusters > 2 {
            members.check_ban(&member, &group, BanType::LongMask2, true).await?;
            members.check_ban(&member, &group, BanType::LongMask3, true).await?;
        }

        let mask: String = mask.concat();
        if !self.masks.take_mask(member.id, &mask).await {
            return Err(OperationError::Invalid(
                "this mask is already in use by an active member".to_string(),
            ));
        }
        self.db.members().set_pinned_mask(member.id, Some(&mask)).await?;
        self.notify_temp(msg.chat_id, format!("✅ Your mask is pinned as {mask}."), 5);
        Ok(())
    }
}

/// Extract emoji grapheme clusters from a body, dropping everything else.
///
/// Covers the emoji blocks the mask alphabet draws from, plus variation
/// selectors, skin tones and ZWJ sequences so a composed emoji stays one
/// cluster.
pub(crate) fn extract_emojis(text: &str) -> Vec<String> {
    fn is_emoji_scalar(c: char) -> bool {
        matches!(u32::from(c),
            0x1F000..=0x1FAFF   // pictographs, symbols, extended-A
            | 0x2600..=0x27BF   // misc symbols, dingbats
            | 0x2B00..=0x2BFF   // misc symbols and arrows
            | 0x2190..=0x21FF   // arrows
            | 0x2300..=0x23FF   // misc technical (hourglass, timer)
            | 0x25A0..=0x25FF   // geometric shapes
            | 0x2049..=0x2139   // doubled punctuation, info
            | 0xFE0F..=0xFE0F   // variation selector-16
        )
    }
    fn is_joiner(c: char) -> bool {
        matches!(u32::from(c), 0x200D | 0xFE0F | 0x1F3FB..=0x1F3FF)
    }

    let mut clusters: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut joined = false;
    for c in text.chars() {
        if is_joiner(c) && !current.is_empty() {
            current.push(c);
            joined = u32::from(c) == 0x200D;
        } else if is_emoji_scalar(c) {
            if !current.is_empty() && !joined {
                clusters.push(std::mem::take(&mut current));
            }
            current.push(c);
            joined = false;
        } else {
            if !current.is_empty() {
                clusters.push(std::mem::take(&mut current));
            }
            joined = false;
        }
    }
    if !current.is_empty() {
        clusters.push(current);
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_emojis() {
        assert_eq!(extract_emojis("🦊"), vec!["🦊"]);
        assert_eq!(extract_emojis("a🦊b🐼"), vec!["🦊", "🐼"]);
        assert!(extract_emojis("plain text").is_empty());
    }

    #[test]
    fn keeps_composed_sequences_together() {
        // Pirate flag: flag + VS16 + ZWJ + skull.
        let pirate = "🏴‍☠️";
        assert_eq!(extract_emojis(pirate).len(), 1);
        // Two separate emojis stay two clusters.
        assert_eq!(extract_emojis("🦊🐼").len(), 2);
    }
}
