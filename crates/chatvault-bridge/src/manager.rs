use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chatvault_massop::{MassOperationProtector, PendingOperation, QueueOutcome};
use chatvault_protocol::{ChangeEvent, ChangeEventData};
use chatvault_storage::StorageAdapter;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Minimum delay between `change_events` resubscribe attempts (seconds).
const BACKOFF_BASE_SECS: u64 = 1;
/// Maximum delay between resubscribe attempts (seconds).
const BACKOFF_MAX_SECS: u64 = 30;
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Capacity of the outbound broadcast channel feeding the WebSocket fan-out
/// and push dispatcher. Slow subscribers lag rather than stall the bridge.
const OUTBOUND_CAPACITY: usize = 1024;
/// Capacity of the channel carrying released mass-op operations from the
/// protector's background loop to the applier task.
const RELEASE_CHANNEL_CAPACITY: usize = 256;

/// Subscribes to a storage backend's change-event feed, routes new-message
/// events straight through, and buffers edit/delete mutations through the
/// mass-operation protector before applying and re-broadcasting them.
pub struct RealtimeBridge {
    storage: Arc<dyn StorageAdapter>,
    massop: Arc<MassOperationProtector>,
    outbound: broadcast::Sender<ChangeEvent>,
    apply_errors: AtomicU64,
}

impl RealtimeBridge {
    pub fn new(storage: Arc<dyn StorageAdapter>, massop: Arc<MassOperationProtector>) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            storage,
            massop,
            outbound,
            apply_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe to the bridge's outbound feed. Intended for the WebSocket
    /// fan-out and push dispatcher; each subscriber gets every event from
    /// the point of subscription onward.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.outbound.subscribe()
    }

    pub fn apply_error_count(&self) -> u64 {
        self.apply_errors.load(Ordering::Relaxed)
    }

    /// Drive the bridge until `shutdown` broadcasts `true`. Spawns the
    /// protector's own release loop alongside the subscribe and apply
    /// loops, then joins all three in order on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let (release_tx, release_rx) = mpsc::channel::<PendingOperation>(RELEASE_CHANNEL_CAPACITY);

        let massop_task = tokio::spawn(
            self.massop
                .clone()
                .run_release_loop(release_tx, shutdown.clone()),
        );
        let apply_task = tokio::spawn(self.clone().apply_released_loop(release_rx));
        let subscribe_task = tokio::spawn(self.clone().subscribe_loop(shutdown));

        if let Err(e) = subscribe_task.await {
            error!(error = %e, "bridge subscribe task panicked");
        }
        if let Err(e) = apply_task.await {
            error!(error = %e, "bridge apply task panicked");
        }
        if let Err(e) = massop_task.await {
            error!(error = %e, "mass-operation release task panicked");
        }
        info!("real-time bridge stopped");
    }

    /// Subscribe to storage's change events and route them. Resubscribes
    /// with exponential backoff and jitter if the channel closes (backend
    /// connection reset, embedded loop-back listener restart).
    async fn subscribe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut delay_secs;
        let mut attempt: u32 = 0;

        loop {
            let mut rx = self.storage.change_events();
            attempt += 1;
            if attempt > 1 {
                info!(attempt, "resubscribed to change-event feed");
            }
            delay_secs = BACKOFF_BASE_SECS;

            loop {
                tokio::select! {
                    recv = rx.recv() => {
                        match recv {
                            Ok(event) => {
                                attempt = 1;
                                self.route(event).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "change-event subscriber lagged, some events dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!(attempt, "change-event feed closed, reconnecting");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("bridge subscribe loop shutting down");
                            return;
                        }
                    }
                }
            }

            let jitter = jitter_secs(delay_secs);
            let wait = delay_secs + jitter;
            warn!(attempt, retry_after_secs = wait, "retrying change-event subscription");
            tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
        }
    }

    #[instrument(skip(self, event), fields(chat_id = event.chat_id, kind = event.kind()))]
    async fn route(&self, event: ChangeEvent) {
        if event.is_new_message() {
            self.publish(event);
            return;
        }
        match self.massop.queue(event.chat_id, event.data.clone()) {
            QueueOutcome::Queued => debug!("mutation buffered"),
            QueueOutcome::Blocked => {}
        }
    }

    async fn apply_released_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PendingOperation>) {
        while let Some(op) = rx.recv().await {
            self.apply_and_forward(op).await;
        }
    }

    #[instrument(skip(self, op), fields(chat_id = op.chat_id))]
    async fn apply_and_forward(&self, op: PendingOperation) {
        let result = match &op.data {
            ChangeEventData::Edit {
                message_id,
                new_text,
                edit_date,
            } => {
                self.storage
                    .apply_message_edit(op.chat_id, *message_id, new_text, *edit_date)
                    .await
            }
            ChangeEventData::Delete { message_id } => {
                self.storage.delete_message(op.chat_id, *message_id).await
            }
            ChangeEventData::NewMessage { .. } => {
                unreachable!("new-message events bypass the mass-operation protector")
            }
        };

        match result {
            Ok(()) => {
                self.publish(ChangeEvent {
                    chat_id: op.chat_id,
                    data: op.data,
                });
            }
            Err(e) => {
                self.apply_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "failed to apply buffered mutation");
            }
        }
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers yet (e.g. during startup) is not an error.
        let _ = self.outbound.send(event);
    }
}

fn jitter_secs(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = ((base_secs as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatvault_core::types::{
        AuditEntry, Chat, ChatStats, Folder, Message, PushSubscription, Topic, ViewerAccount,
    };
    use chatvault_storage::{ChatListFilter, ChatPage, MessagePageFilter, NewAuditEntry};
    use futures_util::stream::BoxStream;
    use std::sync::Mutex;

    struct FakeStorage {
        tx: broadcast::Sender<ChangeEvent>,
        edits: Mutex<Vec<(i64, i64, String)>>,
        deletes: Mutex<Vec<(i64, i64)>>,
    }

    impl FakeStorage {
        fn new() -> (Arc<Self>, broadcast::Sender<ChangeEvent>) {
            let (tx, _) = broadcast::channel(64);
            let storage = Arc::new(Self {
                tx: tx.clone(),
                edits: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            });
            (storage, tx)
        }
    }

    #[async_trait]
    impl StorageAdapter for FakeStorage {
        async fn get_chat(&self, _chat_id: i64) -> chatvault_core::error::Result<Option<Chat>> {
            unimplemented!()
        }
        async fn list_chats(
            &self,
            _limit: u32,
            _offset: u32,
            _filter: ChatListFilter<'_>,
        ) -> chatvault_core::error::Result<ChatPage> {
            unimplemented!()
        }
        async fn count_archived(&self, _allow_ids: Option<&[i64]>) -> chatvault_core::error::Result<i64> {
            unimplemented!()
        }
        async fn get_messages_paginated(
            &self,
            _chat_id: i64,
            _limit: u32,
            _offset: u32,
            _filter: MessagePageFilter<'_>,
        ) -> chatvault_core::error::Result<Vec<Message>> {
            unimplemented!()
        }
        async fn find_message_by_date(
            &self,
            _chat_id: i64,
            _date_utc: chrono::NaiveDateTime,
        ) -> chatvault_core::error::Result<Option<Message>> {
            unimplemented!()
        }
        async fn get_pinned(&self, _chat_id: i64) -> chatvault_core::error::Result<Vec<Message>> {
            unimplemented!()
        }
        async fn get_folders(&self) -> chatvault_core::error::Result<Vec<Folder>> {
            unimplemented!()
        }
        async fn get_topics(&self, _chat_id: i64) -> chatvault_core::error::Result<Vec<Topic>> {
            unimplemented!()
        }
        async fn get_chat_stats(&self, _chat_id: i64) -> chatvault_core::error::Result<ChatStats> {
            unimplemented!()
        }
        async fn get_cached_statistics(&self) -> chatvault_core::error::Result<serde_json::Value> {
            unimplemented!()
        }
        async fn calculate_and_store_statistics(&self) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn get_metadata(&self, _key: &str) -> chatvault_core::error::Result<Option<String>> {
            unimplemented!()
        }
        async fn set_metadata(&self, _key: &str, _value: &str) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        fn iter_messages_for_export(
            &self,
            _chat_id: i64,
        ) -> BoxStream<'static, chatvault_core::error::Result<Message>> {
            unimplemented!()
        }
        async fn apply_message_edit(
            &self,
            chat_id: i64,
            message_id: i64,
            new_text: &str,
            _edit_date: chrono::NaiveDateTime,
        ) -> chatvault_core::error::Result<()> {
            self.edits
                .lock()
                .unwrap()
                .push((chat_id, message_id, new_text.to_string()));
            Ok(())
        }
        async fn delete_message(&self, chat_id: i64, message_id: i64) -> chatvault_core::error::Result<()> {
            self.deletes.lock().unwrap().push((chat_id, message_id));
            Ok(())
        }
        async fn get_viewer_account(
            &self,
            _id: i64,
        ) -> chatvault_core::error::Result<Option<ViewerAccount>> {
            unimplemented!()
        }
        async fn get_viewer_by_username(
            &self,
            _username: &str,
        ) -> chatvault_core::error::Result<Option<ViewerAccount>> {
            unimplemented!()
        }
        async fn list_viewer_accounts(&self) -> chatvault_core::error::Result<Vec<ViewerAccount>> {
            unimplemented!()
        }
        async fn create_viewer_account(
            &self,
            _username: &str,
            _password_hash: &str,
            _salt: &str,
            _allowed_chat_ids: Option<&[i64]>,
            _created_by: &str,
        ) -> chatvault_core::error::Result<ViewerAccount> {
            unimplemented!()
        }
        async fn update_viewer_account(
            &self,
            _id: i64,
            _password_hash: Option<&str>,
            _salt: Option<&str>,
            _allowed_chat_ids: Option<Option<&[i64]>>,
            _is_active: Option<bool>,
        ) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn delete_viewer_account(&self, _id: i64) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn create_audit_log(&self, _entry: NewAuditEntry<'_>) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn get_audit_logs(
            &self,
            _limit: u32,
            _offset: u32,
            _username: Option<&str>,
        ) -> chatvault_core::error::Result<(Vec<AuditEntry>, i64)> {
            unimplemented!()
        }
        async fn upsert_push_subscription(
            &self,
            _sub: &PushSubscription,
        ) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn delete_push_subscription(&self, _endpoint: &str) -> chatvault_core::error::Result<()> {
            unimplemented!()
        }
        async fn list_push_subscriptions(&self) -> chatvault_core::error::Result<Vec<PushSubscription>> {
            unimplemented!()
        }
        fn change_events(&self) -> broadcast::Receiver<ChangeEvent> {
            self.tx.subscribe()
        }
    }

    fn edit_event(chat_id: i64, message_id: i64) -> ChangeEvent {
        ChangeEvent {
            chat_id,
            data: ChangeEventData::Edit {
                message_id,
                new_text: "hello".to_string(),
                edit_date: chrono::Utc::now().naive_utc(),
            },
        }
    }

    #[tokio::test]
    async fn new_message_forwards_immediately_bypassing_massop() {
        let (storage, storage_tx) = FakeStorage::new();
        let massop = Arc::new(MassOperationProtector::new(10, 30, 2.0));
        let bridge = Arc::new(RealtimeBridge::new(storage, massop));
        let mut out = bridge.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(bridge.clone().run(shutdown_rx));

        let event = ChangeEvent {
            chat_id: 1,
            data: ChangeEventData::NewMessage {
                message: serde_json::json!({"id": 1}),
            },
        };
        storage_tx.send(event).unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), out.recv())
            .await
            .expect("event should arrive promptly")
            .unwrap();
        assert!(received.is_new_message());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn edit_is_buffered_then_applied_and_forwarded() {
        let (storage, storage_tx) = FakeStorage::new();
        let massop = Arc::new(MassOperationProtector::new(10, 30, 0.0));
        let bridge = Arc::new(RealtimeBridge::new(storage.clone(), massop));
        let mut out = bridge.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(bridge.clone().run(shutdown_rx));

        storage_tx.send(edit_event(7, 42)).unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), out.recv())
            .await
            .expect("edit should eventually be released and forwarded")
            .unwrap();
        assert_eq!(received.chat_id, 7);
        assert!(matches!(received.data, ChangeEventData::Edit { message_id, .. } if message_id == 42));
        assert_eq!(storage.edits.lock().unwrap().len(), 1);

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
}
