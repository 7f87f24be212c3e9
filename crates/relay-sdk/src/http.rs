//! HTTP long-polling transport.
//!
//! Implements [`PlatformClient`] over the platform's HTTP bot gateway with
//! reqwest. Rate limits are retried here with the server-provided delay so
//! the relay core never sees them; other failures are classified by
//! [`classify_error`].
//!
//! The HTTP gateway cannot fetch arbitrary historical messages, so
//! [`PlatformClient::get_messages`] reports `MESSAGE_FETCH_UNSUPPORTED`;
//! history replay degrades gracefully on this transport.

use crate::client::{ClientFactory, PlatformClient};
use crate::error::SdkError;
use crate::types::{
    BotCommand, BotProfile, ButtonGrid, CopyRequest, Entity, EntityKind, InboundMessage,
    MediaKind, MediaRef, PeerInfo, Sent, Update, VoicePayload,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Long-poll timeout passed to the gateway.
const POLL_TIMEOUT_SECS: u64 = 25;

/// How many times a rate-limited call is retried before giving up.
const RATE_LIMIT_RETRIES: u32 = 3;

/// A single bot's HTTP connection.
pub struct BotApiClient {
    http: reqwest::Client,
    base: String,
    file_base: String,
    offset: AtomicI64,
    buffered: Mutex<VecDeque<Update>>,
    closed: AtomicBool,
}

impl BotApiClient {
    pub fn new(token: &str, api_base: &str, proxy: Option<&str>) -> Self {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(
            POLL_TIMEOUT_SECS + 10,
        ));
        if let Some(proxy) = proxy {
            match reqwest::Proxy::all(proxy) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!(proxy = %proxy, error = %e, "Ignoring invalid proxy"),
            }
        }
        let http = builder.build().unwrap_or_default();
        let api_base = api_base.trim_end_matches('/');
        Self {
            http,
            base: format!("{api_base}/bot{token}"),
            file_base: format!("{api_base}/file/bot{token}"),
            offset: AtomicI64::new(0),
            buffered: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// POST one gateway method, retrying transparent rate limits.
    async fn call(&self, method: &str, params: Value) -> Result<Value, SdkError> {
        let url = format!("{}/{}", self.base, method);
        let mut attempt = 0;
        loop {
            let resp = self
                .http
                .post(&url)
                .json(&params)
                .send()
                .await
                .map_err(|e| SdkError::Network(e.to_string()))?;
            let status = resp.status().as_u16();
            let body: Value = resp
                .json()
                .await
                .map_err(|e| SdkError::Network(e.to_string()))?;

            if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                return Ok(body.get("result").cloned().unwrap_or(Value::Null));
            }

            let err = classify_error(status, &body);
            if let SdkError::RateLimited(secs) = err {
                attempt += 1;
                if attempt <= RATE_LIMIT_RETRIES {
                    tracing::debug!(method, secs, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    continue;
                }
            }
            return Err(err);
        }
    }

    async fn poll_updates(&self) -> Result<Vec<Update>, SdkError> {
        let offset = self.offset.load(Ordering::Acquire);
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message", "edited_message"],
                }),
            )
            .await?;

        let mut updates = Vec::new();
        if let Some(items) = result.as_array() {
            for item in items {
                if let Some(id) = item.get("update_id").and_then(Value::as_i64) {
                    self.offset.store(id + 1, Ordering::Release);
                }
                if let Some(msg) = item.get("message").and_then(parse_message) {
                    updates.push(Update::Message(msg));
                } else if let Some(msg) = item.get("edited_message").and_then(parse_message) {
                    updates.push(Update::EditedMessage(msg));
                }
            }
        }
        Ok(updates)
    }
}

#[async_trait]
impl PlatformClient for BotApiClient {
    async fn connect(&self) -> Result<BotProfile, SdkError> {
        let me = self.call("getMe", json!({})).await?;
        Ok(BotProfile {
            id: me.get("id").and_then(Value::as_i64).unwrap_or_default(),
            username: me
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: me
                .get("first_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn disconnect(&self) -> Result<(), SdkError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn next_update(&self) -> Option<Update> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(update) = self.buffered.lock().await.pop_front() {
                return Some(update);
            }
            match self.poll_updates().await {
                Ok(updates) => {
                    let mut buffered = self.buffered.lock().await;
                    buffered.extend(updates);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Update poll failed, retrying");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Update poll failed terminally");
                    return None;
                }
            }
        }
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&ButtonGrid>,
        reply_to_mid: Option<i64>,
    ) -> Result<i64, SdkError> {
        let mut params = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = markup {
            params["reply_markup"] = markup_json(markup);
        }
        if let Some(mid) = reply_to_mid {
            params["reply_to_message_id"] = json!(mid);
        }
        let result = self.call("sendMessage", params).await?;
        Ok(message_id(&result))
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        caption: Option<&str>,
        markup: Option<&ButtonGrid>,
    ) -> Result<i64, SdkError> {
        let mut params = json!({ "chat_id": chat_id, "photo": file_id });
        if let Some(caption) = caption {
            params["caption"] = json!(caption);
        }
        if let Some(markup) = markup {
            params["reply_markup"] = markup_json(markup);
        }
        let result = self.call("sendPhoto", params).await?;
        Ok(message_id(&result))
    }

    async fn send_voice(
        &self,
        chat_id: i64,
        voice: &VoicePayload,
        caption: Option<&str>,
        reply_to_mid: Option<i64>,
    ) -> Result<Sent, SdkError> {
        let result = match voice {
            VoicePayload::FileId(file_id) => {
                let mut params = json!({ "chat_id": chat_id, "voice": file_id });
                if let Some(caption) = caption {
                    params["caption"] = json!(caption);
                }
                if let Some(mid) = reply_to_mid {
                    params["reply_to_message_id"] = json!(mid);
                }
                self.call("sendVoice", params).await?
            }
            VoicePayload::Ogg { data, duration } => {
                let url = format!("{}/sendVoice", self.base);
                let part = reqwest::multipart::Part::bytes(data.clone())
                    .file_name("voice.ogg")
                    .mime_str("audio/ogg")
                    .map_err(|e| SdkError::Network(e.to_string()))?;
                let mut form = reqwest::multipart::Form::new()
                    .text("chat_id", chat_id.to_string())
                    .text("duration", duration.to_string())
                    .part("voice", part);
                if let Some(caption) = caption {
                    form = form.text("caption", caption.to_string());
                }
                if let Some(mid) = reply_to_mid {
                    form = form.text("reply_to_message_id", mid.to_string());
                }
                let resp = self
                    .http
                    .post(&url)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| SdkError::Network(e.to_string()))?;
                let status = resp.status().as_u16();
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| SdkError::Network(e.to_string()))?;
                if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                    return Err(classify_error(status, &body));
                }
                body.get("result").cloned().unwrap_or(Value::Null)
            }
        };
        let file_id = result
            .get("voice")
            .and_then(|v| v.get("file_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Sent {
            mid: message_id(&result),
            file_id,
        })
    }

    async fn copy_message(&self, req: &CopyRequest) -> Result<i64, SdkError> {
        // Text messages carry a rewritten body, which the gateway cannot
        // attach to a copy; send them as fresh messages instead.
        if let Some(text) = &req.text {
            let mut params = json!({ "chat_id": req.to_chat, "text": text });
            if !req.entities.is_empty() {
                params["entities"] = entities_json(&req.entities);
            }
            if let Some(mid) = req.reply_to_mid {
                params["reply_to_message_id"] = json!(mid);
            }
            let result = self.call("sendMessage", params).await?;
            return Ok(message_id(&result));
        }

        let mut params = json!({
            "chat_id": req.to_chat,
            "from_chat_id": req.from_chat,
            "message_id": req.mid,
        });
        if let Some(caption) = &req.caption {
            params["caption"] = json!(caption);
            if !req.entities.is_empty() {
                params["caption_entities"] = entities_json(&req.entities);
            }
        }
        if let Some(mid) = req.reply_to_mid {
            params["reply_to_message_id"] = json!(mid);
        }
        let result = self.call("copyMessage", params).await?;
        Ok(message_id(&result))
    }

    async fn edit_message_text(&self, chat_id: i64, mid: i64, text: &str) -> Result<(), SdkError> {
        self.call(
            "editMessageText",
            json!({ "chat_id": chat_id, "message_id": mid, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn delete_messages(&self, chat_id: i64, mids: &[i64]) -> Result<(), SdkError> {
        self.call(
            "deleteMessages",
            json!({ "chat_id": chat_id, "message_ids": mids }),
        )
        .await?;
        Ok(())
    }

    async fn pin_chat_message(
        &self,
        chat_id: i64,
        mid: i64,
        _both_sides: bool,
        silent: bool,
    ) -> Result<(), SdkError> {
        self.call(
            "pinChatMessage",
            json!({ "chat_id": chat_id, "message_id": mid, "disable_notification": silent }),
        )
        .await?;
        Ok(())
    }

    async fn unpin_chat_message(&self, chat_id: i64, mid: i64) -> Result<(), SdkError> {
        self.call(
            "unpinChatMessage",
            json!({ "chat_id": chat_id, "message_id": mid }),
        )
        .await?;
        Ok(())
    }

    async fn get_messages(&self, _chat_id: i64, _mid: i64) -> Result<InboundMessage, SdkError> {
        Err(SdkError::Rpc("MESSAGE_FETCH_UNSUPPORTED".into()))
    }

    async fn get_users(&self, query: &str) -> Result<PeerInfo, SdkError> {
        let chat = self.call("getChat", json!({ "chat_id": query })).await?;
        Ok(PeerInfo {
            id: chat.get("id").and_then(Value::as_i64).unwrap_or_default(),
            username: chat
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string),
            first_name: chat
                .get("first_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            last_name: chat
                .get("last_name")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn set_bot_commands(&self, commands: &[BotCommand]) -> Result<(), SdkError> {
        let commands: Vec<Value> = commands
            .iter()
            .map(|c| json!({ "command": c.command, "description": c.description }))
            .collect();
        self.call("setMyCommands", json!({ "commands": commands }))
            .await?;
        Ok(())
    }

    async fn download_media(&self, file_id: &str) -> Result<Vec<u8>, SdkError> {
        let file = self.call("getFile", json!({ "file_id": file_id })).await?;
        let path = file
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| SdkError::Rpc("file has no path".into()))?;
        let url = format!("{}/{}", self.file_base, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SdkError::Network(e.to_string()))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SdkError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// [`ClientFactory`] producing [`BotApiClient`]s sharing one endpoint and
/// proxy configuration.
pub struct BotApiFactory {
    api_base: String,
    proxy: Option<String>,
}

impl BotApiFactory {
    pub fn new(api_base: &str, proxy: Option<String>) -> Self {
        Self {
            api_base: api_base.to_string(),
            proxy,
        }
    }
}

impl ClientFactory for BotApiFactory {
    fn create(&self, token: &str) -> Arc<dyn PlatformClient> {
        Arc::new(BotApiClient::new(
            token,
            &self.api_base,
            self.proxy.as_deref(),
        ))
    }
}

/// Map a gateway error response onto the [`SdkError`] taxonomy.
fn classify_error(status: u16, body: &Value) -> SdkError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    if status == 429 {
        let retry_after = body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .unwrap_or(5);
        return SdkError::RateLimited(retry_after);
    }
    let lowered = description.to_ascii_lowercase();
    if lowered.contains("blocked by the user") {
        SdkError::UserBlocked
    } else if lowered.contains("user is deactivated") || status == 401 {
        SdkError::UserDeactivated
    } else if lowered.contains("message is not modified") {
        SdkError::MessageNotModified
    } else {
        SdkError::Rpc(description.to_string())
    }
}

fn message_id(result: &Value) -> i64 {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

fn markup_json(markup: &ButtonGrid) -> Value {
    let rows: Vec<Vec<Value>> = markup
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.text, "url": b.url }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

fn entities_json(entities: &[Entity]) -> Value {
    let items: Vec<Value> = entities
        .iter()
        .map(|e| {
            json!({
                "type": entity_kind_str(e.kind),
                "offset": e.offset,
                "length": e.length,
            })
        })
        .collect();
    Value::Array(items)
}

fn entity_kind_str(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Url => "url",
        EntityKind::TextLink => "text_link",
        EntityKind::Mention => "mention",
        EntityKind::TextMention => "text_mention",
        EntityKind::Bold => "bold",
        EntityKind::Italic => "italic",
        EntityKind::Code => "code",
        EntityKind::Other => "unknown",
    }
}

fn parse_entity_kind(kind: &str) -> EntityKind {
    match kind {
        "url" => EntityKind::Url,
        "text_link" => EntityKind::TextLink,
        "mention" => EntityKind::Mention,
        "text_mention" => EntityKind::TextMention,
        "bold" => EntityKind::Bold,
        "italic" => EntityKind::Italic,
        "code" => EntityKind::Code,
        _ => EntityKind::Other,
    }
}

fn parse_message(msg: &Value) -> Option<InboundMessage> {
    let from = msg.get("from")?;
    let media = parse_media(msg);
    let entities_key = if msg.get("caption").is_some() {
        "caption_entities"
    } else {
        "entities"
    };
    let entities = msg
        .get(entities_key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|e| {
                    Some(Entity {
                        kind: parse_entity_kind(e.get("type")?.as_str()?),
                        offset: e.get("offset")?.as_i64()?,
                        length: e.get("length")?.as_i64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(InboundMessage {
        mid: msg.get("message_id")?.as_i64()?,
        chat_id: msg.get("chat")?.get("id")?.as_i64()?,
        from: PeerInfo {
            id: from.get("id")?.as_i64()?,
            username: from
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string),
            first_name: from
                .get("first_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            last_name: from
                .get("last_name")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        text: msg.get("text").and_then(Value::as_str).map(str::to_string),
        caption: msg
            .get("caption")
            .and_then(Value::as_str)
            .map(str::to_string),
        media,
        entities,
        has_markup: msg.get("reply_markup").is_some(),
        reply_to_mid: msg
            .get("reply_to_message")
            .and_then(|r| r.get("message_id"))
            .and_then(Value::as_i64),
    })
}

fn parse_media(msg: &Value) -> Option<MediaRef> {
    let kinds = [
        ("voice", MediaKind::Voice),
        ("photo", MediaKind::Photo),
        ("video", MediaKind::Video),
        ("sticker", MediaKind::Sticker),
        ("animation", MediaKind::Animation),
        ("audio", MediaKind::Audio),
        ("document", MediaKind::Document),
    ];
    for (key, kind) in kinds {
        if let Some(obj) = msg.get(key) {
            // Photos arrive as an array of sizes; take the largest.
            let obj = if let Some(sizes) = obj.as_array() {
                sizes.last()?
            } else {
                obj
            };
            return Some(MediaRef {
                kind,
                file_id: obj.get("file_id")?.as_str()?.to_string(),
                duration: obj
                    .get("duration")
                    .and_then(Value::as_u64)
                    .map(|d| d as u32),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let body = serde_json::json!({
            "ok": false,
            "description": "Forbidden: bot was blocked by the user",
        });
        assert!(matches!(classify_error(403, &body), SdkError::UserBlocked));

        let body = serde_json::json!({
            "ok": false,
            "description": "Too Many Requests",
            "parameters": { "retry_after": 7 },
        });
        assert!(matches!(classify_error(429, &body), SdkError::RateLimited(7)));

        let body = serde_json::json!({ "ok": false, "description": "Unauthorized" });
        assert!(matches!(
            classify_error(401, &body),
            SdkError::UserDeactivated
        ));
    }

    #[test]
    fn parses_text_message() {
        let raw = serde_json::json!({
            "message_id": 44,
            "chat": { "id": 99 },
            "from": { "id": 99, "first_name": "Ada" },
            "text": "hello",
            "entities": [{ "type": "url", "offset": 0, "length": 5 }],
            "reply_to_message": { "message_id": 40 },
        });
        let msg = parse_message(&raw).unwrap();
        assert_eq!(msg.mid, 44);
        assert_eq!(msg.reply_to_mid, Some(40));
        assert_eq!(msg.entities[0].kind, EntityKind::Url);
    }
}
