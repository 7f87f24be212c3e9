//! Detached bulk replay tasks.
//!
//! Used on welcome-join to replay recent history (and current pins) to a
//! newly joined or rejoined member. Elements are processed sequentially with
//! a one-second inter-send spacing and never interleave with the main
//! consumer. A RECEIVE-denied or banned member short-circuits the whole
//! operation with no side effects. Per-element failures are swallowed and
//! counted; the final counters are reported like any other operation.

use super::fanout::{WorkerCtx, compose_masked, finish, note_failure, reply_anchor};
use super::{Operation, OpState};
use crate::db::models::{BanType, MemberRow, UserRow};
use crate::error::OpResult;
use relay_sdk::CopyRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const INTER_SEND_SPACING: Duration = Duration::from_secs(1);

pub async fn run_bulk(ctx: Arc<WorkerCtx>, op: Operation, shutdown: CancellationToken) {
    let label = op.label();
    let state = Arc::clone(op.state());
    let result = match &op {
        Operation::BulkRedirect {
            message_ids,
            member_id,
            state,
        } => bulk_redirect(&ctx, message_ids, *member_id, state, &shutdown).await,
        Operation::BulkPin {
            message_ids,
            member_id,
            state,
        } => bulk_pin(&ctx, message_ids, *member_id, state, &shutdown).await,
        _ => unreachable!(),
    };
    if let Err(e) = result {
        warn!(op = label, error_code = e.error_code(), error = %e, "Bulk operation failed");
    }
    finish(&ctx, &state, label).await;
}

/// Load the target member and its user, unless the member must not receive.
async fn replay_target(
    ctx: &WorkerCtx,
    member_id: i64,
) -> OpResult<Option<(MemberRow, UserRow)>> {
    let Some(member) = ctx.db.members().by_id(member_id).await? else {
        return Ok(None);
    };
    if member.is_banned() {
        return Ok(None);
    }
    let Some(group) = ctx.db.groups().by_id(member.group_id).await? else {
        return Ok(None);
    };
    if ctx
        .db
        .members()
        .check_ban_quiet(&member, &group, BanType::Receive, false)
        .await?
    {
        return Ok(None);
    }
    let Some(user) = ctx.db.users().by_id(member.user_id).await? else {
        return Ok(None);
    };
    Ok(Some((member, user)))
}

async fn bulk_redirect(
    ctx: &WorkerCtx,
    message_ids: &[i64],
    member_id: i64,
    state: &OpState,
    shutdown: &CancellationToken,
) -> OpResult<()> {
    let Some((member, user)) = replay_target(ctx, member_id).await? else {
        return Ok(());
    };

    for message_id in message_ids {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(INTER_SEND_SPACING) => {}
        }
        let Some(message) = ctx.db.messages().by_id(*message_id).await? else {
            continue;
        };
        if message.member_id == member.id {
            continue;
        }
        // Rejoining members may already hold a copy from before they left.
        if ctx
            .db
            .messages()
            .redirect_for(message.id, member.id)
            .await?
            .is_some()
        {
            continue;
        }
        let Some(owner) = ctx.db.members().by_id(message.member_id).await? else {
            continue;
        };
        let Some(owner_user) = ctx.db.users().by_id(owner.user_id).await? else {
            continue;
        };

        // Refetch the original to rebuild the masked body.
        let source = match ctx.client.get_messages(owner_user.uid, message.mid).await {
            Ok(source) => source,
            Err(e) => {
                state.add_error();
                state.add_request();
                warn!(mid = message.mid, error = %e, "History fetch failed during replay");
                continue;
            }
        };
        let (content, entities) = compose_masked(&message.mask, &source);
        let reply_to_mid = match message.reply_to_id {
            Some(id) => match ctx.db.messages().by_id(id).await? {
                Some(reply) => reply_anchor(&ctx.db, &reply, &member).await?,
                None => None,
            },
            None => None,
        };

        let result = ctx
            .client
            .copy_message(&CopyRequest {
                to_chat: user.uid,
                from_chat: owner_user.uid,
                mid: message.mid,
                text: source.text.as_ref().map(|_| content.clone()),
                caption: source.text.is_none().then(|| content.clone()),
                entities,
                reply_to_mid,
            })
            .await;
        match result {
            Ok(mid) => {
                ctx.db
                    .messages()
                    .record_redirect(message.id, member.id, mid)
                    .await?;
            }
            Err(e) => note_failure(ctx, &member, &e, state).await,
        }
        state.add_request();
    }
    Ok(())
}

async fn bulk_pin(
    ctx: &WorkerCtx,
    message_ids: &[i64],
    member_id: i64,
    state: &OpState,
    shutdown: &CancellationToken,
) -> OpResult<()> {
    let Some((member, user)) = replay_target(ctx, member_id).await? else {
        return Ok(());
    };

    for message_id in message_ids {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(INTER_SEND_SPACING) => {}
        }
        let Some(message) = ctx.db.messages().by_id(*message_id).await? else {
            continue;
        };
        let target_mid = if message.member_id == member.id {
            Some(message.mid)
        } else {
            ctx.db
                .messages()
                .redirect_for(message.id, member.id)
                .await?
                .map(|r| r.mid)
        };
        if let Some(mid) = target_mid
            && let Err(e) = ctx.client.pin_chat_message(user.uid, mid, true, true).await
        {
            note_failure(ctx, &member, &e, state).await;
        }
        state.add_request();
    }
    Ok(())
}
