//! Row models and the ordered role/ban enums.
//!
//! Role comparison is by ordinal; the enums are declared in ascending order
//! so the derived `Ord` matches the stored integer ordering.

use crate::error::OperationError;
use serde::{Deserialize, Serialize};

/// Global (cross-group) user roles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum UserRole {
    None = 0,
    Banned = 10,
    Grouper = 20,
    Invited = 25,
    Awarded = 30,
    Paying = 40,
    Admin = 90,
    Creator = 100,
}

impl UserRole {
    pub fn display(self) -> &'static str {
        match self {
            UserRole::None => "unknown user",
            UserRole::Banned => "banned user",
            UserRole::Grouper => "group creator",
            UserRole::Invited => "invited user",
            UserRole::Awarded => "honored user",
            UserRole::Paying => "paying user",
            UserRole::Admin => "system admin",
            UserRole::Creator => "system creator",
        }
    }

    /// Roles that carry PRIME privileges (voice masking, pins, custom masks).
    pub fn prime() -> &'static [UserRole] {
        &[
            UserRole::Awarded,
            UserRole::Paying,
            UserRole::Admin,
            UserRole::Creator,
        ]
    }

    pub fn from_i32(v: i32) -> UserRole {
        match v {
            10 => UserRole::Banned,
            20 => UserRole::Grouper,
            25 => UserRole::Invited,
            30 => UserRole::Awarded,
            40 => UserRole::Paying,
            90 => UserRole::Admin,
            100 => UserRole::Creator,
            _ => UserRole::None,
        }
    }
}

/// Per-group member roles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum MemberRole {
    None = 0,
    Banned = 10,
    Left = 20,
    Guest = 30,
    Member = 40,
    Admin = 60,
    AdminMsg = 70,
    AdminBan = 80,
    AdminAdmin = 90,
    Creator = 100,
}

impl MemberRole {
    pub fn display(self) -> &'static str {
        match self {
            MemberRole::None => "unknown member",
            MemberRole::Banned => "banned member",
            MemberRole::Left => "former member",
            MemberRole::Guest => "guest",
            MemberRole::Member => "member",
            MemberRole::Admin => "admin",
            MemberRole::AdminMsg => "message admin",
            MemberRole::AdminBan => "ban admin",
            MemberRole::AdminAdmin => "admin manager",
            MemberRole::Creator => "creator",
        }
    }
}

/// Capability denials a ban group can carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum BanType {
    None = 0,
    Receive = 10,
    Message = 20,
    Media = 21,
    Sticker = 22,
    Markup = 23,
    Long = 24,
    Link = 25,
    PinMask = 30,
    LongMask1 = 40,
    LongMask2 = 41,
    LongMask3 = 42,
    PmUser = 50,
    PmAdmin = 51,
    Invite = 60,
}

impl BanType {
    /// Verb phrase used in ban notices: "you cannot {verb} in this group".
    pub fn display(self) -> &'static str {
        match self {
            BanType::None => "do this",
            BanType::Receive => "receive messages",
            BanType::Message => "send messages",
            BanType::Media => "send messages with media",
            BanType::Sticker => "send stickers",
            BanType::Markup => "send messages with buttons",
            BanType::Long => "send messages longer than 200 characters",
            BanType::Link => "send messages containing links",
            BanType::PinMask => "pin a mask",
            BanType::LongMask1 => "set a mask longer than 1 emoji",
            BanType::LongMask2 => "set a mask longer than 2 emojis",
            BanType::LongMask3 => "set a mask longer than 3 emojis",
            BanType::PmUser => "send private messages to members",
            BanType::PmAdmin => "send private messages to admins",
            BanType::Invite => "create invite links",
        }
    }

    /// Every real ban type, for admin selection surfaces.
    pub fn all() -> &'static [BanType] {
        &[
            BanType::Receive,
            BanType::Message,
            BanType::Media,
            BanType::Sticker,
            BanType::Markup,
            BanType::Long,
            BanType::Link,
            BanType::PinMask,
            BanType::LongMask1,
            BanType::LongMask2,
            BanType::LongMask3,
            BanType::PmUser,
            BanType::PmAdmin,
            BanType::Invite,
        ]
    }
}

/// A global user identity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    /// Platform id, unique.
    pub uid: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub created_at: i64,
}

impl UserRow {
    pub fn name(&self) -> String {
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

    /// Partially-redacted display name for non-admin surfaces.
    pub fn masked_name(&self) -> String {
        let first: Vec<char> = self.first_name.as_deref().unwrap_or("").chars().collect();
        let last: Vec<char> = self.last_name.as_deref().unwrap_or("").chars().collect();
        match (first.as_slice(), last.as_slice()) {
            ([], []) => "◼◼".to_string(),
            (f, []) => format!("{}◼◼", f[0]),
            ([], l) => format!("◼◼{}", l[l.len() - 1]),
            ([_], l) => format!("◼◼{}", l[l.len() - 1]),
            (f, [_]) => format!("{}◼◼", f[0]),
            (f, l) => format!("{}◼ ◼{}", f[0], l[l.len() - 1]),
        }
    }
}

/// A live role grant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ValidationRow {
    pub id: i64,
    pub user_id: i64,
    pub role: UserRole,
    pub until: Option<i64>,
    pub created_at: i64,
}

/// A redeemable (code, role) row; `used_validation` is set once consumed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ValidationRequestRow {
    pub id: i64,
    pub code: Option<String>,
    pub role: UserRole,
    pub days: Option<i64>,
    pub created_by: i64,
    pub used_validation: Option<i64>,
    pub created_at: i64,
}

/// A hosted relay.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub id: i64,
    /// Platform id of the bot account.
    pub uid: i64,
    pub token: String,
    pub username: String,
    pub title: Option<String>,
    pub creator_id: i64,
    pub created_at: i64,
    pub last_activity: i64,
    pub default_ban_group_id: i64,
    pub welcome_message: Option<String>,
    pub welcome_photo: Option<String>,
    pub welcome_buttons: Option<String>,
    /// Replay recent history to joining members.
    pub welcome_latest: bool,
    pub chat_instruction: Option<String>,
    pub password: Option<String>,
    pub private: bool,
    pub disabled: bool,
}

/// A (group, user) membership.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberRow {
    pub id: i64,
    pub group_id: i64,
    pub user_id: i64,
    pub role: MemberRole,
    pub created_at: i64,
    pub last_activity: i64,
    pub last_mask: Option<String>,
    pub pinned_mask: Option<String>,
    pub ban_group_id: Option<i64>,
    pub invitor_id: Option<i64>,
}

impl MemberRow {
    pub fn is_banned(&self) -> bool {
        self.role == MemberRole::Banned
    }

    pub fn has(&self, role: MemberRole) -> bool {
        self.role >= role
    }

    /// Fail unless this member holds at least `role`.
    pub fn require(&self, role: MemberRole) -> Result<(), OperationError> {
        if self.role >= role {
            Ok(())
        } else {
            Err(OperationError::MemberRole {
                role,
                reversed: false,
            })
        }
    }

    /// Fail if this member's role is `role` or below.
    pub fn require_above(&self, role: MemberRole) -> Result<(), OperationError> {
        if self.role > role {
            Ok(())
        } else {
            Err(OperationError::MemberRole {
                role,
                reversed: true,
            })
        }
    }
}

/// The authoritative record of a broadcast.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub group_id: i64,
    /// Message id on the sender side.
    pub mid: i64,
    pub member_id: i64,
    pub mask: String,
    pub pinned: bool,
    pub reply_to_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A recipient-side copy of a broadcast message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RedirectRow {
    pub id: i64,
    pub message_id: i64,
    pub to_member_id: i64,
    /// Message id on the recipient side.
    pub mid: i64,
    pub created_at: i64,
}

/// A tunneled private message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PmMessageRow {
    pub id: i64,
    pub from_member_id: Option<i64>,
    pub to_member_id: i64,
    pub mid: i64,
    pub redirected_mid: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_order_follows_ordinals() {
        assert!(MemberRole::Creator > MemberRole::AdminAdmin);
        assert!(MemberRole::Guest > MemberRole::Left);
        assert!(UserRole::Paying > UserRole::Awarded);
        assert!(UserRole::Invited > UserRole::Grouper);
    }

    fn member(role: MemberRole) -> MemberRow {
        MemberRow {
            id: 1,
            group_id: 1,
            user_id: 1,
            role,
            created_at: 0,
            last_activity: 0,
            last_mask: None,
            pinned_mask: None,
            ban_group_id: None,
            invitor_id: None,
        }
    }

    #[test]
    fn member_requirements() {
        assert!(member(MemberRole::Admin).require(MemberRole::Member).is_ok());
        assert!(member(MemberRole::Guest).require(MemberRole::Admin).is_err());
        // A LEFT member fails the "above LEFT" guard; a GUEST passes it.
        assert!(member(MemberRole::Left).require_above(MemberRole::Left).is_err());
        assert!(member(MemberRole::Guest).require_above(MemberRole::Left).is_ok());
    }

    #[test]
    fn masked_names_hide_the_middle() {
        let user = UserRow {
            id: 1,
            uid: 1,
            username: None,
            first_name: Some("Alice".into()),
            last_name: Some("Stone".into()),
            created_at: 0,
        };
        assert_eq!(user.masked_name(), "A◼ ◼e");
    }
}
