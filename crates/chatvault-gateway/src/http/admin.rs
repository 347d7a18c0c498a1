use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use axum_extra::extract::CookieJar;
use chatvault_access::{NewViewerAccount, ViewerAccountUpdate};
use chatvault_core::error::ChatvaultError;
use chatvault_core::types::Role;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::info;

use crate::app::AppState;
use crate::auth::resolve_caller;
use crate::error::{ApiError, ApiResult};

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;

/// Require the caller to hold the master role, returning their username for
/// audit purposes.
async fn require_master(jar: &CookieJar, state: &AppState) -> ApiResult<String> {
    let caller = resolve_caller(jar, state)?;
    if caller.role != Role::Master {
        return Err(ChatvaultError::Forbidden("master role required".to_string()).into());
    }
    Ok(caller.username)
}

fn validate_username(username: &str, master_username: &str) -> ApiResult<()> {
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(ChatvaultError::BadRequest(format!(
            "username must be at least {MIN_USERNAME_LEN} characters"
        ))
        .into());
    }
    if username.eq_ignore_ascii_case(master_username) {
        return Err(ChatvaultError::BadRequest("username collides with the master account".to_string()).into());
    }
    Ok(())
}

fn validate_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(
            ChatvaultError::BadRequest(format!("password must be at least {MIN_PASSWORD_LEN} characters")).into(),
        );
    }
    Ok(())
}

/// `GET /api/admin/viewers`
pub async fn list_viewers_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    require_master(&jar, &state).await?;
    let accounts = state.admin.list_viewer_accounts().await?;
    let redacted: Vec<_> = accounts
        .into_iter()
        .map(|a| {
            json!({
                "id": a.id,
                "username": a.username,
                "allowed_chat_ids": a.allowed_chat_ids,
                "is_active": a.is_active,
                "created_by": a.created_by,
                "created_at": a.created_at,
                "updated_at": a.updated_at,
            })
        })
        .collect();
    Ok(axum::Json(json!({ "viewers": redacted })))
}

#[derive(Debug, Deserialize)]
pub struct CreateViewerRequest {
    username: String,
    password: String,
    allowed_chat_ids: Option<Vec<i64>>,
}

/// `POST /api/admin/viewers`
pub async fn create_viewer_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<CreateViewerRequest>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let master = require_master(&jar, &state).await?;
    validate_username(&req.username, &state.config.auth.master_username)?;
    validate_password(&req.password)?;

    let account = state
        .admin
        .create_viewer_account(
            NewViewerAccount {
                username: req.username.clone(),
                password: req.password,
                allowed_chat_ids: req.allowed_chat_ids,
            },
            &master,
        )
        .await?;
    info!(username = %account.username, "viewer account created");
    let _ = state
        .admin
        .record_audit(&master, Role::Master, "viewer_created", Some("/api/admin/viewers"), None, None, None)
        .await;
    Ok(axum::Json(json!({
        "id": account.id,
        "username": account.username,
        "allowed_chat_ids": account.allowed_chat_ids,
        "is_active": account.is_active,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateViewerRequest {
    #[serde(default)]
    password: Option<String>,
    /// Present-but-null clears the restriction; absent leaves it unchanged.
    #[serde(default, deserialize_with = "deserialize_double_option")]
    allowed_chat_ids: Option<Option<Vec<i64>>>,
    #[serde(default)]
    is_active: Option<bool>,
}

fn deserialize_double_option<'de, D>(deserializer: D) -> Result<Option<Option<Vec<i64>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// `PUT /api/admin/viewers/{id}`
pub async fn update_viewer_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
    Json(req): Json<UpdateViewerRequest>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let master = require_master(&jar, &state).await?;
    if let Some(pw) = &req.password {
        validate_password(pw)?;
    }

    let target = state
        .storage
        .get_viewer_account(id)
        .await?
        .ok_or_else(|| ApiError::from(ChatvaultError::NotFound(format!("viewer {id}"))))?;

    state
        .admin
        .update_viewer_account(
            id,
            ViewerAccountUpdate {
                new_password: req.password,
                allowed_chat_ids: req.allowed_chat_ids,
                is_active: req.is_active,
            },
        )
        .await?;
    state.sessions.invalidate_for_username(&target.username);
    let _ = state
        .admin
        .record_audit(
            &master,
            Role::Master,
            &format!("viewer_updated:{}", target.username),
            Some("/api/admin/viewers"),
            None,
            None,
            None,
        )
        .await;
    Ok(axum::Json(json!({ "ok": true })))
}

/// `DELETE /api/admin/viewers/{id}`
pub async fn delete_viewer_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(id): Path<i64>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let master = require_master(&jar, &state).await?;
    let target = state
        .storage
        .get_viewer_account(id)
        .await?
        .ok_or_else(|| ApiError::from(ChatvaultError::NotFound(format!("viewer {id}"))))?;

    state.sessions.invalidate_for_username(&target.username);
    state.admin.delete_viewer_account(id).await?;
    let _ = state
        .admin
        .record_audit(
            &master,
            Role::Master,
            &format!("viewer_deleted:{}", target.username),
            Some("/api/admin/viewers"),
            None,
            None,
            None,
        )
        .await;
    Ok(axum::Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
    username: Option<String>,
}

fn default_audit_limit() -> u32 {
    50
}

/// `GET /api/admin/audit`
pub async fn audit_log_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(q): Query<AuditQuery>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    require_master(&jar, &state).await?;
    let (entries, total) = state
        .admin
        .get_audit_logs(q.limit, q.offset, q.username.as_deref())
        .await?;
    Ok(axum::Json(json!({ "entries": entries, "total": total, "limit": q.limit, "offset": q.offset })))
}

/// `GET /api/admin/chats` — unrestricted listing for account-scope pickers.
pub async fn admin_chats_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    require_master(&jar, &state).await?;
    let page = state
        .storage
        .list_chats(
            chatvault_core::config::MAX_CHATS_PAGE,
            0,
            chatvault_storage::ChatListFilter::default(),
        )
        .await?;
    let chats: Vec<_> = page
        .chats
        .into_iter()
        .map(|c| json!({ "id": c.id, "title": c.title, "type": c.kind }))
        .collect();
    Ok(axum::Json(json!({ "chats": chats })))
}
