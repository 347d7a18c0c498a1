//! Best-effort Web Push delivery for new-message events. A no-op unless
//! `push_notifications = full` and a VAPID key pair is configured (§4.7).

use std::sync::Arc;

use chatvault_core::config::{PushConfig, PushMode};
use chatvault_core::types::PushSubscription;
use chatvault_protocol::{ChangeEvent, ChangeEventData};
use chatvault_storage::StorageAdapter;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use web_push::{
    ContentEncoding, SubscriptionInfo, SubscriptionKeys, VapidSignatureBuilder, WebPushClient,
    WebPushMessageBuilder,
};

const TRUNCATE_CHARS: usize = 120;

pub struct PushDispatcher {
    storage: Arc<dyn StorageAdapter>,
    bridge: Arc<chatvault_bridge::RealtimeBridge>,
    config: PushConfig,
    mode: PushMode,
    client: web_push::IsahcWebPushClient,
}

impl PushDispatcher {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        bridge: Arc<chatvault_bridge::RealtimeBridge>,
        config: PushConfig,
        mode: PushMode,
    ) -> anyhow::Result<Self> {
        let client = web_push::IsahcWebPushClient::new()?;
        Ok(Self {
            storage,
            bridge,
            config,
            mode,
            client,
        })
    }

    fn enabled(&self) -> bool {
        self.mode == PushMode::Full
            && self.config.vapid_private_key.is_some()
            && self.config.vapid_public_key.is_some()
    }

    /// Consume the change-event feed for as long as `shutdown` has not
    /// fired, dispatching a push for every `new_message` event.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled() {
            info!("push dispatcher disabled (mode or VAPID keys not configured)");
            return;
        }
        let mut events = self.bridge.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) if event.is_new_message() => {
                            self.dispatch(&event).await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "push dispatcher lagged behind change feed");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("push dispatcher stopped");
    }

    #[instrument(skip(self, event), fields(chat_id = event.chat_id))]
    async fn dispatch(&self, event: &ChangeEvent) {
        let ChangeEventData::NewMessage { message } = &event.data else {
            return;
        };

        let subscriptions = match self.storage.list_push_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(error = %e, "failed to load push subscriptions");
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }

        let chat_title = self
            .storage
            .get_chat(event.chat_id)
            .await
            .ok()
            .flatten()
            .and_then(|c| c.title)
            .unwrap_or_else(|| event.chat_id.to_string());
        let body = notification_body(message);

        for sub in subscriptions {
            if let Some(allowed) = &sub.allowed_chat_ids {
                if !allowed.contains(&event.chat_id) {
                    continue;
                }
            }
            self.send_one(&sub, &chat_title, &body, event).await;
        }
    }

    async fn send_one(&self, sub: &PushSubscription, title: &str, body: &str, event: &ChangeEvent) {
        let payload = serde_json::json!({
            "title": title,
            "body": body,
            "icon": "/icons/chat.png",
            "data": { "chat_id": event.chat_id, "message_id": message_id(event) },
        })
        .to_string();

        let subscription_info = SubscriptionInfo {
            endpoint: sub.endpoint.clone(),
            keys: SubscriptionKeys {
                p256dh: sub.p256dh.clone(),
                auth: sub.auth_secret.clone(),
            },
        };

        let result = self.build_and_send(&subscription_info, &payload).await;
        match result {
            Ok(()) => debug!(endpoint = %sub.endpoint, "push delivered"),
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("404") || msg.contains("410") || msg.contains("gone") || msg.contains("not found") {
                    info!(endpoint = %sub.endpoint, "push subscription stale, deleting");
                    if let Err(e) = self.storage.delete_push_subscription(&sub.endpoint).await {
                        warn!(error = %e, "failed to delete stale push subscription");
                    }
                } else {
                    warn!(endpoint = %sub.endpoint, error = %e, "push delivery failed");
                }
            }
        }
    }

    async fn build_and_send(&self, subscription_info: &SubscriptionInfo, payload: &str) -> anyhow::Result<()> {
        let private_key = self
            .config
            .vapid_private_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("vapid private key not configured"))?;

        let mut sig_builder = VapidSignatureBuilder::from_pem(private_key.as_bytes(), subscription_info)?;
        if let Some(subject) = &self.config.vapid_subject {
            sig_builder.add_claim("sub", subject.as_str());
        }
        let signature = sig_builder.build()?;

        let mut builder = WebPushMessageBuilder::new(subscription_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());
        builder.set_vapid_signature(signature);
        let message = builder.build()?;

        self.client.send(message).await?;
        Ok(())
    }
}

fn message_id(event: &ChangeEvent) -> Option<i64> {
    match &event.data {
        ChangeEventData::NewMessage { message } => message.get("id").and_then(|v| v.as_i64()),
        ChangeEventData::Edit { message_id, .. } | ChangeEventData::Delete { message_id } => Some(*message_id),
    }
}

/// `"<sender>: <truncated text>"`, or `"[Media]"` when the message carries
/// no text (a photo, voice note, sticker, etc).
fn notification_body(message: &serde_json::Value) -> String {
    let text = message.get("text").and_then(|v| v.as_str()).unwrap_or("");
    if text.trim().is_empty() {
        return "[Media]".to_string();
    }
    let truncated: String = text.chars().take(TRUNCATE_CHARS).collect();
    let truncated = if text.chars().count() > TRUNCATE_CHARS {
        format!("{truncated}…")
    } else {
        truncated
    };
    match message.get("sender_id").and_then(|v| v.as_i64()) {
        Some(sender) => format!("{sender}: {truncated}"),
        None => truncated,
    }
}
