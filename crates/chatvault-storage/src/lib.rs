//! Uniform async capability set over the two archival database backends.
//!
//! Scope filtering is never performed here — every call takes its limits
//! literally and the caller intersects with the resolved scope.

pub mod embedded;
pub mod server;

use async_trait::async_trait;
use chatvault_core::error::Result;
use chatvault_core::types::{
    AuditEntry, Chat, ChatStats, Folder, Message, PushSubscription, Topic, ViewerAccount,
};
use chatvault_protocol::ChangeEvent;
use futures_util::stream::BoxStream;

pub use embedded::EmbeddedStorage;
pub use server::ServerStorage;

/// A page of listed chats alongside the total matching count.
pub struct ChatPage {
    pub chats: Vec<Chat>,
    pub total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatListFilter<'a> {
    pub search: Option<&'a str>,
    pub archived: Option<bool>,
    pub folder_id: Option<i64>,
    /// `None` means unrestricted; `Some(ids)` restricts to these chat ids.
    pub allow_ids: Option<&'a [i64]>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePageFilter<'a> {
    pub search: Option<&'a str>,
    pub before_date: Option<chrono::NaiveDateTime>,
    pub before_id: Option<i64>,
    pub topic_id: Option<i64>,
}

/// The capability set exposed uniformly by both backend variants.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_chat(&self, chat_id: i64) -> Result<Option<Chat>>;
    async fn list_chats(&self, limit: u32, offset: u32, filter: ChatListFilter<'_>)
        -> Result<ChatPage>;
    async fn count_archived(&self, allow_ids: Option<&[i64]>) -> Result<i64>;

    async fn get_messages_paginated(
        &self,
        chat_id: i64,
        limit: u32,
        offset: u32,
        filter: MessagePageFilter<'_>,
    ) -> Result<Vec<Message>>;
    async fn find_message_by_date(
        &self,
        chat_id: i64,
        date_utc: chrono::NaiveDateTime,
    ) -> Result<Option<Message>>;
    async fn get_pinned(&self, chat_id: i64) -> Result<Vec<Message>>;
    async fn get_folders(&self) -> Result<Vec<Folder>>;
    async fn get_topics(&self, chat_id: i64) -> Result<Vec<Topic>>;
    async fn get_chat_stats(&self, chat_id: i64) -> Result<ChatStats>;
    async fn get_cached_statistics(&self) -> Result<serde_json::Value>;
    async fn calculate_and_store_statistics(&self) -> Result<()>;

    async fn get_metadata(&self, key: &str) -> Result<Option<String>>;
    async fn set_metadata(&self, key: &str, value: &str) -> Result<()>;

    /// Stream every message of `chat_id` one at a time, oldest first. Must
    /// not load the whole chat into memory.
    fn iter_messages_for_export(&self, chat_id: i64) -> BoxStream<'static, Result<Message>>;

    async fn apply_message_edit(
        &self,
        chat_id: i64,
        message_id: i64,
        new_text: &str,
        edit_date: chrono::NaiveDateTime,
    ) -> Result<()>;
    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    async fn get_viewer_account(&self, id: i64) -> Result<Option<ViewerAccount>>;
    async fn get_viewer_by_username(&self, username: &str) -> Result<Option<ViewerAccount>>;
    async fn list_viewer_accounts(&self) -> Result<Vec<ViewerAccount>>;
    async fn create_viewer_account(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        allowed_chat_ids: Option<&[i64]>,
        created_by: &str,
    ) -> Result<ViewerAccount>;
    async fn update_viewer_account(
        &self,
        id: i64,
        password_hash: Option<&str>,
        salt: Option<&str>,
        allowed_chat_ids: Option<Option<&[i64]>>,
        is_active: Option<bool>,
    ) -> Result<()>;
    async fn delete_viewer_account(&self, id: i64) -> Result<()>;

    async fn create_audit_log(&self, entry: NewAuditEntry<'_>) -> Result<()>;
    async fn get_audit_logs(
        &self,
        limit: u32,
        offset: u32,
        username: Option<&str>,
    ) -> Result<(Vec<AuditEntry>, i64)>;

    async fn upsert_push_subscription(&self, sub: &PushSubscription) -> Result<()>;
    async fn delete_push_subscription(&self, endpoint: &str) -> Result<()>;
    async fn list_push_subscriptions(&self) -> Result<Vec<PushSubscription>>;

    /// A single-consumer stream of normalised mutation notifications. Each
    /// call returns a fresh receiver; only one consumer (the real-time
    /// bridge) is expected to hold one at a time.
    fn change_events(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent>;

    /// Feed an externally-observed mutation into the change-event feed.
    /// Only the embedded backend needs this (SQLite has no pub/sub, so the
    /// loop-back ingest route calls through to it); the server backend
    /// learns of mutations via its own `LISTEN/NOTIFY` subscription and
    /// ignores this by default.
    fn publish_loopback_event(&self, _event: ChangeEvent) {}
}

pub struct NewAuditEntry<'a> {
    pub username: &'a str,
    pub role: chatvault_core::types::Role,
    pub action: &'a str,
    pub endpoint: Option<&'a str>,
    pub chat_id: Option<i64>,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}
