use std::sync::Arc;

use axum::extract::State;
use axum_extra::extract::CookieJar;
use chatvault_core::config::StorageBackendKind;
use chatvault_core::error::ChatvaultError;
use chatvault_core::types::Role;
use serde_json::json;

use crate::app::AppState;
use crate::auth::resolve_caller;
use crate::error::ApiResult;

/// `GET /api/stats` — cached statistics augmented with configuration flags.
pub async fn stats_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    resolve_caller(&jar, &state)?;
    let cached = state.storage.get_cached_statistics().await?;
    Ok(axum::Json(json!({
        "stats": cached,
        "timezone": state.config.viewer_timezone,
        "push_mode": state.config.push_notifications,
        "listener_active": state.config.storage.backend == StorageBackendKind::Server,
    })))
}

/// `POST /api/stats/refresh` — master-only, recomputes synchronously.
pub async fn refresh_stats_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    if caller.role != Role::Master {
        return Err(ChatvaultError::Forbidden("master role required".to_string()).into());
    }
    state.storage.calculate_and_store_statistics().await?;
    let cached = state.storage.get_cached_statistics().await?;
    Ok(axum::Json(json!({ "stats": cached })))
}
