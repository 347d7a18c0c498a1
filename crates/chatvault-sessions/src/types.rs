use chatvault_core::types::{Role, Scope};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A live cookie-backed login. Kept entirely in memory — never persisted,
/// so a process restart logs everyone out.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSession {
    pub token: String,
    pub username: String,
    pub role: Role,
    /// The account's own restriction, snapshotted at login. A master's
    /// account change (e.g. narrowing `allowed_chat_ids`) takes effect on
    /// the viewer's next login, not mid-session.
    pub allowed_chat_ids: Scope,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}
