use std::sync::{Arc, RwLock};

use chatvault_core::types::{mark_supergroup, CallerContext, Scope};
use chatvault_storage::StorageAdapter;
use tracing::{info, warn};

use crate::error::Result;

/// Resolves the chat ids a given caller may see: the intersection of the
/// account's own restriction and the master's configured display filter.
///
/// The display filter is normalised once, at startup, against the storage
/// backend — callers never see the unnormalised configured ids.
pub struct ScopeResolver {
    storage: Arc<dyn StorageAdapter>,
    display_filter: RwLock<Scope>,
}

impl ScopeResolver {
    pub fn new(storage: Arc<dyn StorageAdapter>, configured_display_chat_ids: Option<Vec<i64>>) -> Self {
        Self {
            storage,
            display_filter: RwLock::new(configured_display_chat_ids.map(|ids| ids.into_iter().collect())),
        }
    }

    /// Probe each configured display id against storage and substitute the
    /// `-100…` supergroup/channel marking when the bare id is not itself a
    /// known chat but its marked form is. Must run once, after the storage
    /// adapter is ready and before the HTTP listener starts accepting
    /// connections — callers may otherwise be denied chats that exist only
    /// under their marked id.
    pub async fn normalize_display_filter(&self) -> Result<()> {
        let configured = {
            let guard = self.display_filter.read().unwrap();
            guard.clone()
        };
        let Some(ids) = configured else {
            return Ok(());
        };

        let mut normalized = std::collections::HashSet::with_capacity(ids.len());
        for id in ids {
            if self.storage.get_chat(id).await?.is_some() {
                normalized.insert(id);
                continue;
            }
            let marked = mark_supergroup(id);
            if self.storage.get_chat(marked).await?.is_some() {
                info!(configured_id = id, marked_id = marked, "auto-corrected display filter entry");
                normalized.insert(marked);
            } else {
                warn!(configured_id = id, "display filter entry matches no known chat");
                normalized.insert(id);
            }
        }

        *self.display_filter.write().unwrap() = Some(normalized);
        Ok(())
    }

    pub fn display_filter(&self) -> Scope {
        self.display_filter.read().unwrap().clone()
    }

    /// The chat ids visible to `caller`: their own restriction narrowed by
    /// the master's display filter. `None` means unrestricted.
    pub fn effective_scope(&self, caller: &CallerContext) -> Scope {
        chatvault_core::types::intersect_scope(&caller.allowed_chat_ids, &self.display_filter())
    }

    pub fn allows(&self, caller: &CallerContext, chat_id: i64) -> bool {
        chatvault_core::types::scope_allows(&self.effective_scope(caller), chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatvault_core::error::Result as CoreResult;
    use chatvault_core::types::{AuditEntry, Chat, ChatStats, ChatType, Folder, Message, PushSubscription, Topic, ViewerAccount};
    use chatvault_protocol::ChangeEvent;
    use chatvault_storage::{ChatListFilter, ChatPage, MessagePageFilter, NewAuditEntry};
    use futures_util::stream::BoxStream;

    struct FakeStorage {
        known_chat_ids: Vec<i64>,
    }

    #[async_trait]
    impl StorageAdapter for FakeStorage {
        async fn get_chat(&self, chat_id: i64) -> CoreResult<Option<Chat>> {
            Ok(self.known_chat_ids.contains(&chat_id).then(|| Chat {
                id: chat_id,
                kind: ChatType::Supergroup,
                title: None,
                username: None,
                avatar_photo_id: None,
                archived: false,
                folder_id: None,
                last_message_date: chrono::Utc::now().naive_utc(),
                last_synced_message_id: 0,
            }))
        }
        async fn list_chats(&self, _: u32, _: u32, _: ChatListFilter<'_>) -> CoreResult<ChatPage> {
            unimplemented!()
        }
        async fn count_archived(&self, _: Option<&[i64]>) -> CoreResult<i64> {
            unimplemented!()
        }
        async fn get_messages_paginated(&self, _: i64, _: u32, _: u32, _: MessagePageFilter<'_>) -> CoreResult<Vec<Message>> {
            unimplemented!()
        }
        async fn find_message_by_date(&self, _: i64, _: chrono::NaiveDateTime) -> CoreResult<Option<Message>> {
            unimplemented!()
        }
        async fn get_pinned(&self, _: i64) -> CoreResult<Vec<Message>> {
            unimplemented!()
        }
        async fn get_folders(&self) -> CoreResult<Vec<Folder>> {
            unimplemented!()
        }
        async fn get_topics(&self, _: i64) -> CoreResult<Vec<Topic>> {
            unimplemented!()
        }
        async fn get_chat_stats(&self, _: i64) -> CoreResult<ChatStats> {
            unimplemented!()
        }
        async fn get_cached_statistics(&self) -> CoreResult<serde_json::Value> {
            unimplemented!()
        }
        async fn calculate_and_store_statistics(&self) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_metadata(&self, _: &str) -> CoreResult<Option<String>> {
            unimplemented!()
        }
        async fn set_metadata(&self, _: &str, _: &str) -> CoreResult<()> {
            unimplemented!()
        }
        fn iter_messages_for_export(&self, _: i64) -> BoxStream<'static, CoreResult<Message>> {
            unimplemented!()
        }
        async fn apply_message_edit(&self, _: i64, _: i64, _: &str, _: chrono::NaiveDateTime) -> CoreResult<()> {
            unimplemented!()
        }
        async fn delete_message(&self, _: i64, _: i64) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_viewer_account(&self, _: i64) -> CoreResult<Option<ViewerAccount>> {
            unimplemented!()
        }
        async fn get_viewer_by_username(&self, _: &str) -> CoreResult<Option<ViewerAccount>> {
            unimplemented!()
        }
        async fn list_viewer_accounts(&self) -> CoreResult<Vec<ViewerAccount>> {
            unimplemented!()
        }
        async fn create_viewer_account(&self, _: &str, _: &str, _: &str, _: Option<&[i64]>, _: &str) -> CoreResult<ViewerAccount> {
            unimplemented!()
        }
        async fn update_viewer_account(&self, _: i64, _: Option<&str>, _: Option<&str>, _: Option<Option<&[i64]>>, _: Option<bool>) -> CoreResult<()> {
            unimplemented!()
        }
        async fn delete_viewer_account(&self, _: i64) -> CoreResult<()> {
            unimplemented!()
        }
        async fn create_audit_log(&self, _: NewAuditEntry<'_>) -> CoreResult<()> {
            unimplemented!()
        }
        async fn get_audit_logs(&self, _: u32, _: u32, _: Option<&str>) -> CoreResult<(Vec<AuditEntry>, i64)> {
            unimplemented!()
        }
        async fn upsert_push_subscription(&self, _: &PushSubscription) -> CoreResult<()> {
            unimplemented!()
        }
        async fn delete_push_subscription(&self, _: &str) -> CoreResult<()> {
            unimplemented!()
        }
        async fn list_push_subscriptions(&self) -> CoreResult<Vec<PushSubscription>> {
            unimplemented!()
        }
        fn change_events(&self) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn normalizes_bare_id_to_marked_supergroup() {
        let marked = mark_supergroup(42);
        let storage = Arc::new(FakeStorage { known_chat_ids: vec![marked] });
        let resolver = ScopeResolver::new(storage, Some(vec![42]));
        resolver.normalize_display_filter().await.unwrap();
        let filter = resolver.display_filter().unwrap();
        assert!(filter.contains(&marked));
        assert!(!filter.contains(&42));
    }

    #[tokio::test]
    async fn leaves_already_known_ids_untouched() {
        let storage = Arc::new(FakeStorage { known_chat_ids: vec![7] });
        let resolver = ScopeResolver::new(storage, Some(vec![7]));
        resolver.normalize_display_filter().await.unwrap();
        assert_eq!(resolver.display_filter().unwrap(), [7].into_iter().collect());
    }

    #[test]
    fn effective_scope_intersects_caller_restriction_with_display_filter() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(FakeStorage { known_chat_ids: vec![] });
        let resolver = ScopeResolver::new(storage, Some(vec![1, 2, 3]));
        let caller = CallerContext {
            username: "viewer1".into(),
            role: chatvault_core::types::Role::Viewer,
            allowed_chat_ids: Some([2, 3, 4].into_iter().collect()),
        };
        assert_eq!(resolver.effective_scope(&caller), Some([2, 3].into_iter().collect()));
    }
}
