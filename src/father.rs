//! The operator ("father") service: accepts bot credentials, issues and
//! redeems codes, lists and deletes hosted groups.

use crate::db::Database;
use crate::db::models::{UserRole, UserRow};
use crate::error::{OpResult, OperationError};
use crate::fleet::Fleet;
use crate::relay::{ConvStatus, Conversation, ConversationMap};
use relay_sdk::{BotCommand, BotProfile, InboundMessage, PlatformClient, Update};
use std::sync::{Arc, LazyLock, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shape of a hostable bot credential.
static TOKEN_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[0-9]{8,10}:[a-zA-Z0-9_-]{35}").expect("token regex")
});

/// Validation codes issued through `/createcode` are short invite codes.
const FATHER_CODE_LEN: usize = 8;

pub struct Father {
    client: Arc<dyn PlatformClient>,
    db: Database,
    fleet: Arc<Fleet>,
    conversations: ConversationMap,
    invite_award_days: i64,
    profile: OnceLock<BotProfile>,
    shutdown: CancellationToken,
}

impl Father {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        db: Database,
        fleet: Arc<Fleet>,
        invite_award_days: i64,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            db,
            fleet,
            conversations: ConversationMap::default(),
            invite_award_days,
            profile: OnceLock::new(),
            shutdown,
        })
    }

    pub async fn run(self: Arc<Self>) -> OpResult<()> {
        let profile = self.client.connect().await?;
        info!(father = %profile.username, "Operator service connected");
        self.profile.set(profile).ok();

        let commands = vec![
            BotCommand::new("start", "Show the panel"),
            BotCommand::new("newgroup", "Host a new anonymous group"),
            BotCommand::new("createcode", "Create an invite link"),
            BotCommand::new("usecode", "Redeem a role code"),
            BotCommand::new("mygroups", "List your groups"),
            BotCommand::new("delgroup", "Delete one of your groups"),
        ];
        if let Err(e) = self.client.set_bot_commands(&commands).await {
            warn!(error = %e, "Operator command registration failed");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                update = self.client.next_update() => match update {
                    Some(update) => {
                        let father = Arc::clone(&self);
                        tokio::spawn(async move { father.handle_update(update).await });
                    }
                    None => break,
                },
            }
        }
        let _ = self.client.disconnect().await;
        info!("Operator service stopped");
        Ok(())
    }

    pub async fn handle_update(&self, update: Update) {
        let msg = update.message().clone();
        let result = match msg.command() {
            Some((command, arg)) => {
                let arg = arg.map(str::to_string);
                self.dispatch(&msg, command, arg.as_deref()).await
            }
            None => self.on_message(&msg).await,
        };
        if let Err(e) = result {
            warn!(error_code = e.error_code(), error = %e, "Operator handler error");
            let _ = self
                .client
                .send_message(msg.chat_id, &format!("⚠️ Failed: {}.", e.notice()), None, None)
                .await;
        }
    }

    async fn dispatch(
        &self,
        msg: &InboundMessage,
        command: &str,
        arg: Option<&str>,
    ) -> OpResult<()> {
        let user = self.db.users().get_or_create(&msg.from).await?;
        if command != "start" {
            self.db
                .users()
                .require(user.id, &[UserRole::Banned], true)
                .await?;
        }
        match command {
            "start" => self.on_start(msg, &user, arg).await,
            "newgroup" => self.on_new_group(msg).await,
            "createcode" => self.on_create_code(msg, &user).await,
            "usecode" => match arg {
                Some(code) => self.redeem(msg, &user, code).await,
                None => {
                    self.conversations.set(
                        msg.chat_id,
                        msg.from.id,
                        Some(Conversation::new(ConvStatus::UseCode)),
                    );
                    self.reply(msg, "❓ Send the role code:").await
                }
            },
            "mygroups" => self.on_my_groups(msg, &user).await,
            "delgroup" => self.on_del_group(msg, &user, arg).await,
            _ => self.reply(msg, "⚠️ Unknown command.").await,
        }
    }

    async fn on_message(&self, msg: &InboundMessage) -> OpResult<()> {
        let Some(conversation) = self.conversations.take(msg.chat_id, msg.from.id) else {
            return Ok(());
        };
        let user = self.db.users().get_or_create(&msg.from).await?;
        match conversation.status {
            ConvStatus::UseCode => {
                let code = msg.text.as_deref().unwrap_or_default().trim().to_string();
                self.redeem(msg, &user, &code).await
            }
            ConvStatus::NgToken => self.host_new_group(msg, &user).await,
            _ => Ok(()),
        }
    }

    async fn on_start(
        &self,
        msg: &InboundMessage,
        user: &UserRow,
        arg: Option<&str>,
    ) -> OpResult<()> {
        if let Some(arg) = arg {
            if let Some(code) = arg.strip_prefix("_c_") {
                return self.redeem(msg, user, code).await;
            }
            if let Some(gid) = arg.strip_prefix("_g_") {
                return self.group_detail(msg, user, gid).await;
            }
        }
        let roles = self.db.users().roles_of(user.id).await?;
        let mut panel = format!(
            "🌈 Welcome {}!\n\nThis bot hosts fully anonymous groups.\n\
             Use /newgroup to host one with your own bot credential.",
            user.name()
        );
        if !roles.is_empty() {
            panel.push_str("\n\n👑 Your roles:\n");
            for role in roles {
                panel.push_str(&format!("  - {}\n", role.display()));
            }
        }
        self.reply(msg, &panel).await
    }

    async fn on_create_code(&self, msg: &InboundMessage, user: &UserRow) -> OpResult<()> {
        let codes = self
            .db
            .users()
            .create_code(user.id, &[UserRole::Invited], None, FATHER_CODE_LEN, 1)
            .await?;
        let username = self
            .profile
            .get()
            .map(|p| p.username.clone())
            .unwrap_or_default();
        self.reply(
            msg,
            &format!(
                "🔗 Share this link with your friends:\n\n\
                 https://t.me/{username}?start=_c_{}\n\n\
                 ⭐ Once your friend hosts their first anonymous group, you both \
                 receive {} days of PRIME.",
                codes[0], self.invite_award_days
            ),
        )
        .await
    }

    async fn redeem(&self, msg: &InboundMessage, user: &UserRow, code: &str) -> OpResult<()> {
        let used = self.db.users().use_code(user.id, code).await?;
        if used.is_empty() {
            return self.reply(msg, "⚠️ Invalid code.").await;
        }
        if used.len() == 1 && used[0].0 == UserRole::Invited {
            return self
                .reply(
                    msg,
                    &format!(
                        "🌈 Welcome {}!\n\nYou have been invited: host your first \
                         anonymous group with /newgroup and you will both receive \
                         {} days of PRIME.",
                        user.name(),
                        self.invite_award_days
                    ),
                )
                .await;
        }
        let mut text = "ℹ️ You now hold the following roles:\n".to_string();
        for (role, days) in used {
            let days = days
                .map(|d| format!("{d} days"))
                .unwrap_or_else(|| "permanent".to_string());
            text.push_str(&format!("  - {} ({days})\n", role.display()));
        }
        self.reply(msg, &text).await
    }

    async fn on_new_group(&self, msg: &InboundMessage) -> OpResult<()> {
        self.conversations.set(
            msg.chat_id,
            msg.from.id,
            Some(Conversation::new(ConvStatus::NgToken)),
        );
        self.reply(
            msg,
            "🌈 To host a new anonymous group you need a bot of your own:\n\n\
             1. Create a new bot with the platform's bot registrar.\n\
             2. Send me the message containing the bot token.",
        )
        .await
    }

    /// `ng_token`: the next message must carry a hostable credential.
    async fn host_new_group(&self, msg: &InboundMessage, user: &UserRow) -> OpResult<()> {
        let text = msg.text.as_deref().unwrap_or_default();
        let Some(token) = TOKEN_RE.find(text).map(|m| m.as_str().to_string()) else {
            return self.reply(msg, "⚠️ That is not a valid bot token.").await;
        };
        if let Some(group) = self.db.groups().by_token(&token).await? {
            if group.disabled {
                return self
                    .reply(
                        msg,
                        "⚠️ This group was deleted. To re-create it, obtain a fresh \
                         token from the bot registrar; to restore it, contact the \
                         system administrator.",
                    )
                    .await;
            }
            return self.reply(msg, "⚠️ This bot is already an anonymous group.").await;
        }

        self.reply(msg, "ℹ️ One moment, the group is starting...").await?;
        match self.fleet.start_group_bot(&token, Some(user.clone())).await {
            Ok(relay) => {
                let username = relay
                    .profile()
                    .map(|p| p.username.clone())
                    .unwrap_or_default();
                self.reply(
                    msg,
                    &format!("✅ Done. Your anonymous group @{username} is live."),
                )
                .await
            }
            Err(e) => {
                self.reply(msg, &format!("⚠️ Starting the group failed: {}.", e.notice()))
                    .await
            }
        }
    }

    async fn on_my_groups(&self, msg: &InboundMessage, user: &UserRow) -> OpResult<()> {
        let groups = self.db.groups().by_creator(user.id).await?;
        if groups.is_empty() {
            return self.reply(msg, "⚠️ You have not created any groups.").await;
        }
        let mut text = "⭐ Your groups:\n\n".to_string();
        for group in groups {
            let state = if group.disabled { " (deleted)" } else { "" };
            text.push_str(&format!(
                "{} | @{}{state}\n",
                group.id, group.username
            ));
        }
        text.push_str("\nUse /delgroup <id> to delete one.");
        self.reply(msg, &text).await
    }

    async fn group_detail(&self, msg: &InboundMessage, user: &UserRow, gid: &str) -> OpResult<()> {
        let group = self.resolve_own_group(user, gid).await?;
        let n_members = self.db.groups().n_members(group.id).await?;
        let n_messages = self.db.groups().n_messages(group.id).await?;
        self.reply(
            msg,
            &format!(
                "⭐ Anonymous group @{}:\n\n\
                 Members: {n_members}\n\
                 Messages: {n_messages}\n\
                 Deleted: {}\n",
                group.username,
                if group.disabled { "yes" } else { "no" },
            ),
        )
        .await
    }

    async fn on_del_group(
        &self,
        msg: &InboundMessage,
        user: &UserRow,
        arg: Option<&str>,
    ) -> OpResult<()> {
        let Some(gid) = arg else {
            return self.reply(msg, "⚠️ Use /delgroup <id>.").await;
        };
        let group = self.resolve_own_group(user, gid).await?;
        self.fleet.stop_group_bot(&group.token).await;
        self.db.groups().set_disabled(group.id, true).await?;
        self.reply(msg, &format!("✅ Group @{} deleted.", group.username)).await
    }

    /// Resolve a group id, requiring ownership (system admins excepted).
    async fn resolve_own_group(
        &self,
        user: &UserRow,
        gid: &str,
    ) -> OpResult<crate::db::models::GroupRow> {
        let id: i64 = gid
            .parse()
            .map_err(|_| OperationError::Invalid("not a valid group id".to_string()))?;
        let group = self
            .db
            .groups()
            .by_id(id)
            .await?
            .ok_or_else(|| OperationError::Invalid("no such group".to_string()))?;
        if group.creator_id != user.id
            && !self
                .db
                .users()
                .validate(user.id, &[UserRole::Admin, UserRole::Creator])
                .await?
        {
            return Err(OperationError::Invalid("this is not your group".to_string()));
        }
        Ok(group)
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) -> OpResult<()> {
        self.client
            .send_message(msg.chat_id, text, None, None)
            .await
            .map_err(OperationError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_regex_extracts_credentials() {
        let text = "here it is: 12345678:AAAAAAAAAABBBBBBBBBBccccccccccDDDDD done";
        let token = TOKEN_RE.find(text).unwrap().as_str();
        assert_eq!(token, "12345678:AAAAAAAAAABBBBBBBBBBccccccccccDDDDD");
        assert!(TOKEN_RE.find("no token in here").is_none());
    }
}
