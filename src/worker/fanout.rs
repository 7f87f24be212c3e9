//! Fan-out execution: one inbound event becomes N outbound RPCs.
//!
//! Exactly one consumer per relay drains the durable queue; bulk replay
//! operations are handed off to detached tasks without blocking it. A single
//! recipient's terminal failure never aborts a fan-out; a store failure
//! during enumeration does, and is logged with the counters it reached.

use super::bulk;
use super::{Operation, OpState, WorkerStatus};
use crate::cache::CacheQueue;
use crate::db::models::{BanType, GroupRow, MemberRole, MemberRow, MessageRow};
use crate::db::{Database, DbError, now_ts};
use crate::error::{OpResult, OperationError};
use crate::voice::VoiceMasker;
use relay_sdk::{CopyRequest, Entity, InboundMessage, PlatformClient, SdkError, VoicePayload};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything an executing operation needs. One per relay.
pub struct WorkerCtx {
    pub db: Database,
    pub client: Arc<dyn PlatformClient>,
    pub group_id: i64,
    pub status: Arc<WorkerStatus>,
    pub global_status: Arc<WorkerStatus>,
    pub voice: Arc<dyn VoiceMasker>,
}

/// Compose the outbound body: `"{mask} | {content}"` with entity offsets
/// shifted past the prefix, or a media placeholder when there is no text.
pub fn compose_masked(mask: &str, source: &InboundMessage) -> (String, Vec<Entity>) {
    match source.content() {
        Some(content) => {
            let prefix = format!("{mask} | ");
            // Entity offsets are UTF-16 code units on the wire.
            let shift = prefix.encode_utf16().count() as i64;
            let entities = source
                .entities
                .iter()
                .map(|e| Entity {
                    kind: e.kind,
                    offset: e.offset + shift,
                    length: e.length,
                })
                .collect();
            (format!("{prefix}{content}"), entities)
        }
        None => (format!("{mask} sent a media."), Vec::new()),
    }
}

/// The relay's single queue consumer. Runs until cancelled.
pub async fn run_worker(
    ctx: Arc<WorkerCtx>,
    queue: Arc<CacheQueue<Operation>>,
    shutdown: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = shutdown.cancelled() => break,
            op = queue.get() => op,
        };

        if op.is_bulk() {
            let ctx = Arc::clone(&ctx);
            let token = shutdown.child_token();
            tokio::spawn(async move { bulk::run_bulk(ctx, op, token).await });
            continue;
        }

        let label = op.label();
        let state = Arc::clone(op.state());
        if let Err(e) = execute(&ctx, &op).await {
            warn!(op = label, error_code = e.error_code(), error = %e, "Worker operation failed");
        }
        finish(&ctx, &state, label).await;
    }
}

/// Report counters to the per-relay and process-wide status, then fire the
/// completion signal. Also used by the bulk tasks.
pub(super) async fn finish(ctx: &WorkerCtx, state: &OpState, label: &'static str) {
    let elapsed = (now_ts() - state.created_at).max(0) as f64;
    let (requests, errors) = state.counts();
    ctx.status.report(elapsed, requests, errors).await;
    ctx.global_status.report(elapsed, requests, errors).await;
    debug!(op = label, requests, errors, "Operation finished");
    state.finished.fire();
}

async fn execute(ctx: &WorkerCtx, op: &Operation) -> OpResult<()> {
    let group = ctx
        .db
        .groups()
        .by_id(ctx.group_id)
        .await?
        .ok_or(OperationError::Storage)?;

    match op {
        Operation::Broadcast {
            source,
            sender_member_id,
            message_id,
            state,
        } => {
            broadcast(ctx, &group, source, *sender_member_id, *message_id, state).await
        }
        Operation::Edit {
            source,
            sender_member_id,
            message_id,
            state,
        } => edit(ctx, &group, source, *sender_member_id, *message_id, state).await,
        Operation::Delete { message_id, state } => {
            delete(ctx, &group, *message_id, state).await
        }
        Operation::Pin { message_id, state } => {
            pin(ctx, &group, *message_id, state, true).await
        }
        Operation::Unpin { message_id, state } => {
            pin(ctx, &group, *message_id, state, false).await
        }
        Operation::BulkRedirect { .. } | Operation::BulkPin { .. } => unreachable!(),
    }
}

/// Recipients of a fan-out: role >= GUEST, not the sender, not banned, not
/// RECEIVE-denied in member scope. Pins skip only the ban filters they need.
async fn eligible(
    ctx: &WorkerCtx,
    group: &GroupRow,
    skip_member: Option<i64>,
    honor_receive: bool,
) -> Result<Vec<MemberRow>, DbError> {
    let mut out = Vec::new();
    for member in ctx.db.members().recipients(group.id).await? {
        if Some(member.id) == skip_member {
            continue;
        }
        if member.is_banned() {
            continue;
        }
        if honor_receive
            && ctx
                .db
                .members()
                .check_ban_quiet(&member, group, BanType::Receive, false)
                .await?
        {
            continue;
        }
        out.push(member);
    }
    Ok(out)
}

/// The recipient-side mid a reply should anchor to, if the recipient ever
/// received a copy. The author's own copy is the source message itself.
pub(super) async fn reply_anchor(
    db: &Database,
    reply_to: &MessageRow,
    member: &MemberRow,
) -> Result<Option<i64>, DbError> {
    if reply_to.member_id == member.id {
        return Ok(Some(reply_to.mid));
    }
    Ok(db
        .messages()
        .redirect_for(reply_to.id, member.id)
        .await?
        .map(|r| r.mid))
}

/// Downgrade an unreachable recipient to LEFT (creators excepted) and count
/// the error.
pub(super) async fn note_failure(
    ctx: &WorkerCtx,
    member: &MemberRow,
    err: &SdkError,
    state: &OpState,
) {
    if err.is_unreachable() && member.role != MemberRole::Creator {
        if let Err(e) = ctx.db.members().set_role(member.id, MemberRole::Left).await {
            warn!(member = member.id, error = %e, "Failed to downgrade unreachable member");
        }
    }
    state.add_error();
}

async fn broadcast(
    ctx: &WorkerCtx,
    group: &GroupRow,
    source: &InboundMessage,
    sender_member_id: i64,
    message_id: i64,
    state: &OpState,
) -> OpResult<()> {
    if ctx.db.groups().cannot(group, BanType::Receive).await? {
        return Ok(());
    }
    let Some(message) = ctx.db.messages().by_id(message_id).await? else {
        warn!(message_id, "Broadcast references a missing message row");
        return Ok(());
    };
    let reply_to = match message.reply_to_id {
        Some(id) => ctx.db.messages().by_id(id).await?,
        None => None,
    };

    let (content, entities) = compose_masked(&message.mask, source);

    // Voice masking: performed once per broadcast when the group or the
    // sender carries PRIME; the uploaded file-id is reused afterwards.
    let mut voice: Option<VoicePayload> = None;
    if source.is_voice() {
        let sender = ctx.db.members().by_id(sender_member_id).await?;
        let sender_prime = match &sender {
            Some(m) => ctx.db.users().is_prime(m.user_id).await?,
            None => false,
        };
        let group_prime = ctx.db.users().is_prime(group.creator_id).await?;
        if sender_prime || group_prime {
            voice = mask_voice_payload(ctx, source).await;
        }
    }

    for recipient in eligible(ctx, group, Some(sender_member_id), true).await? {
        let Some(user) = ctx.db.users().by_id(recipient.user_id).await? else {
            continue;
        };
        let reply_to_mid = match &reply_to {
            Some(msg) => reply_anchor(&ctx.db, msg, &recipient).await?,
            None => None,
        };

        let result = match voice.clone() {
            Some(payload) => match ctx
                .client
                .send_voice(user.uid, &payload, Some(&content), reply_to_mid)
                .await
            {
                Ok(sent) => {
                    // First successful upload: reuse the platform file-id
                    // for every remaining recipient.
                    if let Some(file_id) = sent.file_id {
                        voice = Some(VoicePayload::FileId(file_id));
                    }
                    Ok(sent.mid)
                }
                Err(e) => Err(e),
            },
            None => {
                ctx.client
                    .copy_message(&CopyRequest {
                        to_chat: user.uid,
                        from_chat: source.chat_id,
                        mid: source.mid,
                        text: source.text.as_ref().map(|_| content.clone()),
                        caption: source.text.is_none().then(|| content.clone()),
                        entities: entities.clone(),
                        reply_to_mid,
                    })
                    .await
            }
        };

        match result {
            Ok(mid) => {
                ctx.db
                    .messages()
                    .record_redirect(message.id, recipient.id, mid)
                    .await?;
            }
            Err(e) => note_failure(ctx, &recipient, &e, state).await,
        }
        state.add_request();
    }
    Ok(())
}

async fn mask_voice_payload(ctx: &WorkerCtx, source: &InboundMessage) -> Option<VoicePayload> {
    let media = source.media.as_ref()?;
    let ogg = match ctx.client.download_media(&media.file_id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Voice download failed, sending unmasked copy");
            return None;
        }
    };
    match ctx.voice.mask_voice(&ogg).await {
        Ok((data, duration)) => Some(VoicePayload::Ogg {
            data,
            duration: duration.max(media.duration.unwrap_or(0)),
        }),
        Err(e) => {
            warn!(error = %e, "Voice masking failed, sending unmasked copy");
            None
        }
    }
}

async fn edit(
    ctx: &WorkerCtx,
    group: &GroupRow,
    source: &InboundMessage,
    sender_member_id: i64,
    message_id: i64,
    state: &OpState,
) -> OpResult<()> {
    if ctx.db.groups().cannot(group, BanType::Receive).await? {
        return Ok(());
    }
    let Some(message) = ctx.db.messages().by_id(message_id).await? else {
        return Ok(());
    };
    let (content, _) = compose_masked(&message.mask, source);

    for recipient in eligible(ctx, group, Some(sender_member_id), true).await? {
        // Recipients without a redirect are skipped: an edit never
        // synthesizes a new send.
        if let Some(redirect) = ctx
            .db
            .messages()
            .redirect_for(message.id, recipient.id)
            .await?
        {
            let Some(user) = ctx.db.users().by_id(recipient.user_id).await? else {
                continue;
            };
            match ctx
                .client
                .edit_message_text(user.uid, redirect.mid, &content)
                .await
            {
                Ok(()) | Err(SdkError::MessageNotModified) => {}
                Err(e) => note_failure(ctx, &recipient, &e, state).await,
            }
        }
        state.add_request();
    }
    ctx.db.messages().touch_updated(message.id).await?;
    Ok(())
}

async fn delete(
    ctx: &WorkerCtx,
    group: &GroupRow,
    message_id: i64,
    state: &OpState,
) -> OpResult<()> {
    if ctx.db.groups().cannot(group, BanType::Receive).await? {
        return Ok(());
    }
    let Some(message) = ctx.db.messages().by_id(message_id).await? else {
        return Ok(());
    };

    // The deletion of the source fires with the owner's iteration; partial
    // failure is tolerated and reported through the counters.
    for recipient in eligible(ctx, group, None, true).await? {
        let Some(user) = ctx.db.users().by_id(recipient.user_id).await? else {
            continue;
        };
        let target_mid = if recipient.id == message.member_id {
            Some(message.mid)
        } else {
            ctx.db
                .messages()
                .redirect_for(message.id, recipient.id)
                .await?
                .map(|r| r.mid)
        };
        if let Some(mid) = target_mid
            && let Err(e) = ctx.client.delete_messages(user.uid, &[mid]).await
        {
            note_failure(ctx, &recipient, &e, state).await;
        }
        state.add_request();
    }
    Ok(())
}

async fn pin(
    ctx: &WorkerCtx,
    group: &GroupRow,
    message_id: i64,
    state: &OpState,
    pin: bool,
) -> OpResult<()> {
    if ctx.db.groups().cannot(group, BanType::Receive).await? {
        return Ok(());
    }
    let Some(message) = ctx.db.messages().by_id(message_id).await? else {
        return Ok(());
    };

    // RECEIVE denial is ignored for pins so admin-issued pins stay
    // universally visible; banned members are still suppressed.
    for recipient in eligible(ctx, group, None, false).await? {
        let Some(user) = ctx.db.users().by_id(recipient.user_id).await? else {
            continue;
        };
        let target_mid = if recipient.id == message.member_id {
            Some(message.mid)
        } else {
            ctx.db
                .messages()
                .redirect_for(message.id, recipient.id)
                .await?
                .map(|r| r.mid)
        };
        if let Some(mid) = target_mid {
            let result = if pin {
                ctx.client.pin_chat_message(user.uid, mid, true, true).await
            } else {
                ctx.client.unpin_chat_message(user.uid, mid).await
            };
            if let Err(e) = result {
                note_failure(ctx, &recipient, &e, state).await;
            }
        }
        state.add_request();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_sdk::{EntityKind, PeerInfo};

    fn source(text: Option<&str>, entities: Vec<Entity>) -> InboundMessage {
        InboundMessage {
            mid: 1,
            chat_id: 10,
            from: PeerInfo {
                id: 10,
                username: None,
                first_name: None,
                last_name: None,
            },
            text: text.map(str::to_string),
            caption: None,
            media: None,
            entities,
            has_markup: false,
            reply_to_mid: None,
        }
    }

    #[test]
    fn compose_prefixes_and_shifts_entities() {
        let src = source(
            Some("hello"),
            vec![Entity {
                kind: EntityKind::Bold,
                offset: 0,
                length: 5,
            }],
        );
        let (body, entities) = compose_masked("🦊", &src);
        assert_eq!(body, "🦊 | hello");
        // "🦊 | " is 5 UTF-16 units, so the body starts at offset 5.
        assert_eq!(entities[0].offset, 5);
        assert_eq!(entities[0].length, 5);
    }

    #[test]
    fn compose_media_placeholder() {
        let (body, entities) = compose_masked("🦊", &source(None, Vec::new()));
        assert_eq!(body, "🦊 sent a media.");
        assert!(entities.is_empty());
    }
}
