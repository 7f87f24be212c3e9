//! In-memory client for tests and dry runs.
//!
//! Records every outbound call, lets tests inject inbound updates and
//! per-chat failures, and implements the full [`PlatformClient`] surface
//! with deterministic message ids.

use crate::client::PlatformClient;
use crate::error::SdkError;
use crate::types::{
    BotCommand, BotProfile, ButtonGrid, CopyRequest, Entity, InboundMessage, MediaKind, MediaRef,
    PeerInfo, Sent, Update, VoicePayload,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What kind of outbound call produced a [`SentRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Message,
    Photo,
    Voice,
    Copy,
}

/// One outbound message recorded by the mock.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub chat_id: i64,
    pub mid: i64,
    pub kind: SentKind,
    pub body: Option<String>,
    pub entities: Vec<Entity>,
    pub reply_to_mid: Option<i64>,
    pub file_id: Option<String>,
    /// Source of a copy, when `kind == Copy`.
    pub source: Option<(i64, i64)>,
    pub markup: Option<ButtonGrid>,
}

struct MockState {
    profile: BotProfile,
    updates_tx: Mutex<Option<mpsc::UnboundedSender<Update>>>,
    updates_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Update>>,
    mid_seq: AtomicI64,
    sent: Mutex<Vec<SentRecord>>,
    edits: Mutex<Vec<(i64, i64, String)>>,
    deletions: Mutex<Vec<(i64, i64)>>,
    pins: Mutex<Vec<(i64, i64)>>,
    unpins: Mutex<Vec<(i64, i64)>>,
    commands: Mutex<Vec<BotCommand>>,
    fail_chats: DashMap<i64, SdkError>,
    connect_error: Mutex<Option<SdkError>>,
    messages: DashMap<(i64, i64), InboundMessage>,
    users: DashMap<i64, PeerInfo>,
    media: DashMap<String, Vec<u8>>,
}

/// In-memory [`PlatformClient`]. Cheap to clone.
#[derive(Clone)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    pub fn new(bot_id: i64, username: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                profile: BotProfile {
                    id: bot_id,
                    username: username.to_string(),
                    name: username.to_string(),
                },
                updates_tx: Mutex::new(Some(tx)),
                updates_rx: tokio::sync::Mutex::new(rx),
                mid_seq: AtomicI64::new(1000),
                sent: Mutex::new(Vec::new()),
                edits: Mutex::new(Vec::new()),
                deletions: Mutex::new(Vec::new()),
                pins: Mutex::new(Vec::new()),
                unpins: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                fail_chats: DashMap::new(),
                connect_error: Mutex::new(None),
                messages: DashMap::new(),
                users: DashMap::new(),
                media: DashMap::new(),
            }),
        }
    }

    fn next_mid(&self) -> i64 {
        self.state.mid_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_chat(&self, chat_id: i64) -> Result<(), SdkError> {
        if let Some(err) = self.state.fail_chats.get(&chat_id) {
            return Err(err.clone());
        }
        Ok(())
    }

    // === test-side controls ===

    /// Make connect() fail with the given error.
    pub fn fail_connect(&self, err: SdkError) {
        *self.state.connect_error.lock() = Some(err);
    }

    /// Make every outbound call to `chat_id` fail with the given error.
    pub fn fail_chat(&self, chat_id: i64, err: SdkError) {
        self.state.fail_chats.insert(chat_id, err);
    }

    /// Clear a failure injected with [`Self::fail_chat`].
    pub fn heal_chat(&self, chat_id: i64) {
        self.state.fail_chats.remove(&chat_id);
    }

    /// Register a user so `get_users` can resolve it.
    pub fn register_user(&self, peer: PeerInfo) {
        self.state.users.insert(peer.id, peer);
    }

    /// Inject an inbound private text message from `peer` and return it.
    pub fn push_text(&self, peer: &PeerInfo, text: &str, reply_to_mid: Option<i64>) -> InboundMessage {
        let msg = InboundMessage {
            mid: self.next_mid(),
            chat_id: peer.id,
            from: peer.clone(),
            text: Some(text.to_string()),
            caption: None,
            media: None,
            entities: Vec::new(),
            has_markup: false,
            reply_to_mid,
        };
        self.push_message(msg.clone());
        msg
    }

    /// Inject an inbound voice message from `peer` and return it.
    pub fn push_voice(&self, peer: &PeerInfo, file_id: &str, duration: u32) -> InboundMessage {
        self.state
            .media
            .insert(file_id.to_string(), vec![0x4f, 0x67, 0x67, 0x53]);
        let msg = InboundMessage {
            mid: self.next_mid(),
            chat_id: peer.id,
            from: peer.clone(),
            text: None,
            caption: None,
            media: Some(MediaRef {
                kind: MediaKind::Voice,
                file_id: file_id.to_string(),
                duration: Some(duration),
            }),
            entities: Vec::new(),
            has_markup: false,
            reply_to_mid: None,
        };
        self.push_message(msg.clone());
        msg
    }

    /// Inject a fully built inbound message.
    pub fn push_message(&self, msg: InboundMessage) {
        self.register_user(msg.from.clone());
        self.state.messages.insert((msg.chat_id, msg.mid), msg.clone());
        if let Some(tx) = self.state.updates_tx.lock().as_ref() {
            let _ = tx.send(Update::Message(msg));
        }
    }

    /// Inject an edited version of an already-pushed message.
    pub fn push_edit(&self, mut msg: InboundMessage, new_text: &str) -> InboundMessage {
        msg.text = Some(new_text.to_string());
        self.state.messages.insert((msg.chat_id, msg.mid), msg.clone());
        if let Some(tx) = self.state.updates_tx.lock().as_ref() {
            let _ = tx.send(Update::EditedMessage(msg.clone()));
        }
        msg
    }

    // === test-side inspection ===

    /// All outbound messages sent to `chat_id`, in order.
    pub fn sent_to(&self, chat_id: i64) -> Vec<SentRecord> {
        self.state
            .sent
            .lock()
            .iter()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect()
    }

    /// All recorded (chat, mid) deletions.
    pub fn deletions(&self) -> Vec<(i64, i64)> {
        self.state.deletions.lock().clone()
    }

    /// All recorded edits as (chat, mid, new text).
    pub fn edits(&self) -> Vec<(i64, i64, String)> {
        self.state.edits.lock().clone()
    }

    /// All recorded (chat, mid) pins.
    pub fn pins(&self) -> Vec<(i64, i64)> {
        self.state.pins.lock().clone()
    }

    /// All recorded (chat, mid) unpins.
    pub fn unpins(&self) -> Vec<(i64, i64)> {
        self.state.unpins.lock().clone()
    }

    fn record(&self, rec: SentRecord) -> i64 {
        let mid = rec.mid;
        self.state.sent.lock().push(rec);
        mid
    }
}

#[async_trait]
impl PlatformClient for MockClient {
    async fn connect(&self) -> Result<BotProfile, SdkError> {
        if let Some(err) = self.state.connect_error.lock().clone() {
            return Err(err);
        }
        Ok(self.state.profile.clone())
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        self.state.updates_tx.lock().take();
        Ok(())
    }

    async fn next_update(&self) -> Option<Update> {
        self.state.updates_rx.lock().await.recv().await
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&ButtonGrid>,
        reply_to_mid: Option<i64>,
    ) -> Result<i64, SdkError> {
        self.check_chat(chat_id)?;
        Ok(self.record(SentRecord {
            chat_id,
            mid: self.next_mid(),
            kind: SentKind::Message,
            body: Some(text.to_string()),
            entities: Vec::new(),
            reply_to_mid,
            file_id: None,
            source: None,
            markup: markup.cloned(),
        }))
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: Option<&str>,
        markup: Option<&ButtonGrid>,
    ) -> Result<i64, SdkError> {
        self.check_chat(chat_id)?;
        Ok(self.record(SentRecord {
            chat_id,
            mid: self.next_mid(),
            kind: SentKind::Photo,
            body: caption.map(str::to_string),
            entities: Vec::new(),
            reply_to_mid: None,
            file_id: Some(file_id.to_string()),
            source: None,
            markup: markup.cloned(),
        }))
    }

    async fn send_voice(
        &self,
        chat_id: i64,
        voice: &VoicePayload,
        caption: Option<&str>,
        reply_to_mid: Option<i64>,
    ) -> Result<Sent, SdkError> {
        self.check_chat(chat_id)?;
        let file_id = match voice {
            VoicePayload::FileId(id) => id.clone(),
            VoicePayload::Ogg { .. } => format!("uploaded-{}", self.next_mid()),
        };
        let mid = self.record(SentRecord {
            chat_id,
            mid: self.next_mid(),
            kind: SentKind::Voice,
            body: caption.map(str::to_string),
            entities: Vec::new(),
            reply_to_mid,
            file_id: Some(file_id.clone()),
            source: None,
            markup: None,
        });
        Ok(Sent {
            mid,
            file_id: Some(file_id),
        })
    }

    async fn copy_message(&self, req: &CopyRequest) -> Result<i64, SdkError> {
        self.check_chat(req.to_chat)?;
        Ok(self.record(SentRecord {
            chat_id: req.to_chat,
            mid: self.next_mid(),
            kind: SentKind::Copy,
            body: req.text.clone().or_else(|| req.caption.clone()),
            entities: req.entities.clone(),
            reply_to_mid: req.reply_to_mid,
            file_id: None,
            source: Some((req.from_chat, req.mid)),
            markup: None,
        }))
    }

    async fn edit_message_text(&self, chat_id: i64, mid: i64, text: &str) -> Result<(), SdkError> {
        self.check_chat(chat_id)?;
        self.state.edits.lock().push((chat_id, mid, text.to_string()));
        Ok(())
    }

    async fn delete_messages(&self, chat_id: i64, mids: &[i64]) -> Result<(), SdkError> {
        self.check_chat(chat_id)?;
        let mut deletions = self.state.deletions.lock();
        for mid in mids {
            deletions.push((chat_id, *mid));
        }
        Ok(())
    }

    async fn pin_chat_message(
        &self,
        chat_id: i64,
        mid: i64,
        _both_sides: bool,
        _silent: bool,
    ) -> Result<(), SdkError> {
        self.check_chat(chat_id)?;
        self.state.pins.lock().push((chat_id, mid));
        Ok(())
    }

    async fn unpin_chat_message(&self, chat_id: i64, mid: i64) -> Result<(), SdkError> {
        self.check_chat(chat_id)?;
        self.state.unpins.lock().push((chat_id, mid));
        Ok(())
    }

    async fn get_messages(&self, chat_id: i64, mid: i64) -> Result<InboundMessage, SdkError> {
        self.state
            .messages
            .get(&(chat_id, mid))
            .map(|m| m.clone())
            .ok_or_else(|| SdkError::Rpc("message not found".into()))
    }

    async fn get_users(&self, query: &str) -> Result<PeerInfo, SdkError> {
        let id: i64 = query
            .parse()
            .map_err(|_| SdkError::Rpc(format!("cannot resolve {query}")))?;
        self.state
            .users
            .get(&id)
            .map(|u| u.clone())
            .ok_or_else(|| SdkError::Rpc("user not found".into()))
    }

    async fn set_bot_commands(&self, commands: &[BotCommand]) -> Result<(), SdkError> {
        *self.state.commands.lock() = commands.to_vec();
        Ok(())
    }

    async fn download_media(&self, file_id: &str) -> Result<Vec<u8>, SdkError> {
        self.state
            .media
            .get(file_id)
            .map(|m| m.clone())
            .ok_or_else(|| SdkError::Rpc("media not found".into()))
    }
}
