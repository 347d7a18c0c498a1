use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Supergroups and channels are marked by adding this offset to their magnitude.
pub const SUPERGROUP_MARK_OFFSET: i64 = 1_000_000_000_000;

/// Convert a bare positive chat id into its `-100…` marked form, as used for
/// supergroups and channels.
pub fn mark_supergroup(id: i64) -> i64 {
    -(SUPERGROUP_MARK_OFFSET + id)
}

/// Classify a marked chat id without a storage lookup.
pub fn chat_kind_from_id(id: i64) -> ChatKindGuess {
    if id > 0 {
        ChatKindGuess::Private
    } else if id.unsigned_abs() as i64 >= SUPERGROUP_MARK_OFFSET {
        ChatKindGuess::SupergroupOrChannel
    } else {
        ChatKindGuess::Group
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKindGuess {
    Private,
    Group,
    SupergroupOrChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Bot,
    Group,
    Supergroup,
    Channel,
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChatType::Private => "private",
            ChatType::Bot => "bot",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Channel => "channel",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ChatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(ChatType::Private),
            "bot" => Ok(ChatType::Bot),
            "group" => Ok(ChatType::Group),
            "supergroup" => Ok(ChatType::Supergroup),
            "channel" => Ok(ChatType::Channel),
            other => Err(format!("unknown chat type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    pub title: Option<String>,
    pub username: Option<String>,
    pub avatar_photo_id: Option<i64>,
    pub archived: bool,
    pub folder_id: Option<i64>,
    pub last_message_date: chrono::NaiveDateTime,
    pub last_synced_message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
    Voice,
    VideoNote,
    Audio,
    Animation,
    Sticker,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub date: chrono::NaiveDateTime,
    pub text: String,
    pub reply_to_msg_id: Option<i64>,
    pub forward_from_id: Option<i64>,
    pub edit_date: Option<chrono::NaiveDateTime>,
    pub media_type: Option<MediaType>,
    pub media_id: Option<String>,
    pub media_path: Option<String>,
    pub topic_id: Option<i64>,
    pub is_pinned: bool,
    pub is_outgoing: bool,
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub message_id: i64,
    pub chat_id: i64,
    #[serde(rename = "type")]
    pub kind: MediaType,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<u32>,
    pub downloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub title: String,
    pub chat_count: i64,
}

/// A storage-resident login, optionally restricted to a subset of chats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerAccount {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub allowed_chat_ids: Option<Vec<i64>>,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

/// The two roles a resolved caller may hold; `Master` is derived from
/// configuration credentials and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// A caller's visibility, either unrestricted (`None`) or a finite allow-set.
///
/// `None` must never be conflated with `Some(empty set)` — the former means
/// every chat is visible, the latter means none is.
pub type Scope = Option<HashSet<i64>>;

/// Intersect two scopes using the effective-scope rule from the access
/// resolver: `None` is the unrestricted identity element.
pub fn intersect_scope(a: &Scope, b: &Scope) -> Scope {
    match (a, b) {
        (None, None) => None,
        (Some(s), None) | (None, Some(s)) => Some(s.clone()),
        (Some(a), Some(b)) => Some(a.intersection(b).copied().collect()),
    }
}

pub fn scope_allows(scope: &Scope, chat_id: i64) -> bool {
    match scope {
        None => true,
        Some(ids) => ids.contains(&chat_id),
    }
}

/// Resolved identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub username: String,
    pub role: Role,
    /// The account's own restriction, before intersecting with the master
    /// display filter. `None` for master and for unrestricted viewers.
    pub allowed_chat_ids: Scope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub chat_id: i64,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStats {
    pub chat_id: i64,
    pub message_count: i64,
    pub media_count: i64,
    pub first_message_date: Option<chrono::NaiveDateTime>,
    pub last_message_date: Option<chrono::NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub action: String,
    pub endpoint: Option<String>,
    pub chat_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth_secret: String,
    pub username: Option<String>,
    pub allowed_chat_ids: Option<Vec<i64>>,
    pub user_agent: Option<String>,
    pub created_at: chrono::NaiveDateTime,
}

/// Per-connection identifier for WebSocket clients (not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_supergroup_with_offset() {
        assert_eq!(mark_supergroup(123), -1_000_000_000_123);
    }

    #[test]
    fn classifies_marked_ids() {
        assert_eq!(chat_kind_from_id(555), ChatKindGuess::Private);
        assert_eq!(chat_kind_from_id(-555), ChatKindGuess::Group);
        assert_eq!(
            chat_kind_from_id(-1_000_000_000_123),
            ChatKindGuess::SupergroupOrChannel
        );
    }

    #[test]
    fn none_scope_is_identity_for_intersection() {
        let restricted: Scope = Some([1, 2].into_iter().collect());
        assert_eq!(intersect_scope(&None, &restricted), restricted);
        assert_eq!(intersect_scope(&restricted, &None), restricted);
    }

    #[test]
    fn intersecting_two_sets_narrows_scope() {
        let a: Scope = Some([1, 2, 3].into_iter().collect());
        let b: Scope = Some([2, 3, 4].into_iter().collect());
        let got = intersect_scope(&a, &b).unwrap();
        assert_eq!(got, [2, 3].into_iter().collect());
    }

    #[test]
    fn empty_scope_allows_nothing() {
        let empty: Scope = Some(HashSet::new());
        assert!(!scope_allows(&empty, 42));
        assert!(scope_allows(&None, 42));
    }
}
