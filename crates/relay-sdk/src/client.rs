//! The platform client trait.

use crate::error::SdkError;
use crate::types::{
    BotCommand, BotProfile, ButtonGrid, CopyRequest, InboundMessage, PeerInfo, Sent, Update,
    VoicePayload,
};
use async_trait::async_trait;
use std::sync::Arc;

/// One hosted bot's connection to the messaging platform.
///
/// Every method is a suspension point. Implementations own rate-limit
/// backoff; the relay core treats [`SdkError::RateLimited`] as exceptional.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Open the connection and resolve the bot's own profile.
    async fn connect(&self) -> Result<BotProfile, SdkError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self) -> Result<(), SdkError>;

    /// Next inbound update, or `None` once the client is closed.
    async fn next_update(&self) -> Option<Update>;

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&ButtonGrid>,
        reply_to_mid: Option<i64>,
    ) -> Result<i64, SdkError>;

    async fn send_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: Option<&str>,
        markup: Option<&ButtonGrid>,
    ) -> Result<i64, SdkError>;

    async fn send_voice(
        &self,
        chat_id: i64,
        voice: &VoicePayload,
        caption: Option<&str>,
        reply_to_mid: Option<i64>,
    ) -> Result<Sent, SdkError>;

    /// Re-send an existing message to another chat without a forward header.
    async fn copy_message(&self, req: &CopyRequest) -> Result<i64, SdkError>;

    async fn edit_message_text(&self, chat_id: i64, mid: i64, text: &str)
        -> Result<(), SdkError>;

    async fn delete_messages(&self, chat_id: i64, mids: &[i64]) -> Result<(), SdkError>;

    async fn pin_chat_message(
        &self,
        chat_id: i64,
        mid: i64,
        both_sides: bool,
        silent: bool,
    ) -> Result<(), SdkError>;

    async fn unpin_chat_message(&self, chat_id: i64, mid: i64) -> Result<(), SdkError>;

    /// Fetch a single message by id. Not every transport supports this; the
    /// HTTP transport reports `Rpc("MESSAGE_FETCH_UNSUPPORTED")`.
    async fn get_messages(&self, chat_id: i64, mid: i64) -> Result<InboundMessage, SdkError>;

    /// Resolve a user by numeric id or handle.
    async fn get_users(&self, query: &str) -> Result<PeerInfo, SdkError>;

    async fn set_bot_commands(&self, commands: &[BotCommand]) -> Result<(), SdkError>;

    async fn download_media(&self, file_id: &str) -> Result<Vec<u8>, SdkError>;
}

/// Builds one client per bot credential. The fleet owns a single factory and
/// calls it for every relay it boots.
pub trait ClientFactory: Send + Sync {
    fn create(&self, token: &str) -> Arc<dyn PlatformClient>;
}
