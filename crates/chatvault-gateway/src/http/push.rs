use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::Json;
use axum_extra::extract::CookieJar;
use chatvault_core::error::ChatvaultError;
use chatvault_core::types::PushSubscription;
use chatvault_protocol::ChangeEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::{is_private_ip, resolve_caller};
use crate::error::{ApiError, ApiResult};

/// `GET /api/push/config` — unauthenticated so the front-end can decide
/// whether to prompt for a subscription before the user logs in.
pub async fn config_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let enabled = state.config.push_notifications == chatvault_core::config::PushMode::Full
        && state.config.push.vapid_public_key.is_some();
    Json(json!({
        "mode": state.config.push_notifications,
        "enabled": enabled,
        "vapid_public_key": state.config.push.vapid_public_key,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeKeys {
    p256dh: String,
    auth: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    endpoint: String,
    keys: SubscribeKeys,
}

/// `POST /api/push/subscribe`
pub async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    let sub = PushSubscription {
        endpoint: req.endpoint,
        p256dh: req.keys.p256dh,
        auth_secret: req.keys.auth,
        username: Some(caller.username),
        allowed_chat_ids: scope.map(|s| s.into_iter().collect()),
        user_agent: None,
        created_at: chrono::Utc::now().naive_utc(),
    };
    state.storage.upsert_push_subscription(&sub).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    endpoint: String,
}

/// `POST /api/push/unsubscribe`
pub async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<UnsubscribeRequest>,
) -> ApiResult<Json<Value>> {
    resolve_caller(&jar, &state)?;
    state.storage.delete_push_subscription(&req.endpoint).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /internal/push` — loop-back ingest for the embedded backend, which
/// has no pub/sub of its own. Guarded to loopback and private address
/// ranges; the archiver process posts normalised change events here.
pub async fn internal_push_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(event): Json<ChangeEvent>,
) -> ApiResult<StatusCode> {
    if !is_private_ip(addr.ip()) {
        warn!(peer = %addr, "rejected /internal/push from non-private address");
        return Err(ApiError::from(ChatvaultError::Forbidden(
            "loop-back ingest is restricted to private addresses".to_string(),
        )));
    }
    info!(chat_id = event.chat_id, kind = event.kind(), "loop-back change event received");
    state.storage.publish_loopback_event(event);
    Ok(StatusCode::ACCEPTED)
}
