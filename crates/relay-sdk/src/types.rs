//! Wire-facing message and update types.
//!
//! Everything here is `serde`-serializable: inbound messages ride inside the
//! durable operation queue and must survive a process restart.

use serde::{Deserialize, Serialize};

/// The bot account behind a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotProfile {
    /// Platform id of the bot account.
    pub id: i64,
    /// Public handle (without the leading `@`).
    pub username: String,
    /// Display name.
    pub name: String,
}

/// A platform user as seen on an inbound update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl PeerInfo {
    /// First and last name joined with a space, skipping missing parts.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        if let Some(first) = &self.first_name {
            out.push_str(first);
        }
        if let Some(last) = &self.last_name {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(last);
        }
        out
    }
}

/// Kind of attached media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Animation,
    Audio,
    Voice,
    Sticker,
}

/// Reference to an attached media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    /// Duration in seconds for audio/voice/video media.
    pub duration: Option<u32>,
}

/// Entity kinds the relay core cares about. Anything else is `Other` and is
/// carried through copies untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Url,
    TextLink,
    Mention,
    TextMention,
    Bold,
    Italic,
    Code,
    Other,
}

impl EntityKind {
    /// Whether this entity counts as a link for content checks.
    pub fn is_link(self) -> bool {
        matches!(
            self,
            EntityKind::Url | EntityKind::TextLink | EntityKind::Mention | EntityKind::TextMention
        )
    }
}

/// A text entity. Offsets and lengths are UTF-16 code units, as on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub offset: i64,
    pub length: i64,
}

/// A private message received by a hosted bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message id on the sender side.
    pub mid: i64,
    /// Chat the message arrived in (equals the sender id for private chats).
    pub chat_id: i64,
    pub from: PeerInfo,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<MediaRef>,
    pub entities: Vec<Entity>,
    /// Whether the message carries an inline keyboard.
    pub has_markup: bool,
    /// Message id this one replies to, if any.
    pub reply_to_mid: Option<i64>,
}

impl InboundMessage {
    /// Text or caption, whichever is present.
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().or(self.caption.as_deref())
    }

    /// True when the body starts with a `/command`.
    pub fn is_command(&self) -> bool {
        self.text.as_deref().is_some_and(|t| t.starts_with('/'))
    }

    /// Split a `/command arg` body into the command name and the rest.
    pub fn command(&self) -> Option<(&str, Option<&str>)> {
        let text = self.text.as_deref()?.strip_prefix('/')?;
        let mut parts = text.splitn(2, char::is_whitespace);
        let name = parts.next()?;
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
        Some((name, arg))
    }

    /// True when the attached media is a voice note.
    pub fn is_voice(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|m| m.kind == MediaKind::Voice)
    }
}

/// An inbound update delivered by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Update {
    Message(InboundMessage),
    EditedMessage(InboundMessage),
}

impl Update {
    pub fn message(&self) -> &InboundMessage {
        match self {
            Update::Message(m) | Update::EditedMessage(m) => m,
        }
    }
}

/// One URL button of an inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub url: String,
}

/// An inline keyboard: rows of URL buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonGrid {
    pub rows: Vec<Vec<InlineButton>>,
}

/// A command registered with the platform's command menu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

impl BotCommand {
    pub fn new(command: &str, description: &str) -> Self {
        Self {
            command: command.to_string(),
            description: description.to_string(),
        }
    }
}

/// Parameters of a masked copy of an existing message.
///
/// When `text` is set the copy is a plain text send (the body was rewritten
/// by the caller); otherwise the platform copies the media of
/// (`from_chat`, `mid`) with `caption` overriding the original caption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyRequest {
    pub to_chat: i64,
    pub from_chat: i64,
    pub mid: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub entities: Vec<Entity>,
    pub reply_to_mid: Option<i64>,
}

/// Voice payload for `send_voice`: an already-uploaded file id, or raw ogg
/// bytes to upload.
#[derive(Debug, Clone)]
pub enum VoicePayload {
    FileId(String),
    Ogg { data: Vec<u8>, duration: u32 },
}

/// Result of a send that may have uploaded media.
#[derive(Debug, Clone)]
pub struct Sent {
    pub mid: i64,
    /// Platform file id of uploaded media, when the call uploaded any.
    pub file_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> InboundMessage {
        InboundMessage {
            mid: 1,
            chat_id: 10,
            from: PeerInfo {
                id: 10,
                username: None,
                first_name: Some("A".into()),
                last_name: None,
            },
            text: Some(text.to_string()),
            caption: None,
            media: None,
            entities: Vec::new(),
            has_markup: false,
            reply_to_mid: None,
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(msg("/start").command(), Some(("start", None)));
        assert_eq!(msg("/start _c_ABC").command(), Some(("start", Some("_c_ABC"))));
        assert_eq!(msg("/pm hello there").command(), Some(("pm", Some("hello there"))));
        assert_eq!(msg("hello").command(), None);
    }

    #[test]
    fn display_name_joins_parts() {
        let peer = PeerInfo {
            id: 1,
            username: None,
            first_name: Some("Ada".into()),
            last_name: Some("L".into()),
        };
        assert_eq!(peer.display_name(), "Ada L");
    }
}
