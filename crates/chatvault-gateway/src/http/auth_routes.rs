use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use axum_extra::extract::CookieJar;
use chatvault_core::error::ChatvaultError;
use chatvault_core::types::Role;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;
use crate::auth::{self, ClientIp};
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// `GET /api/auth/check`
pub async fn check_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> Json<Value> {
    match auth::resolve_caller_optional(&jar, &state) {
        Some(ctx) => Json(json!({
            "authenticated": true,
            "auth_required": true,
            "role": ctx.role,
            "username": ctx.username,
        })),
        None => Json(json!({
            "authenticated": false,
            "auth_required": true,
        })),
    }
}

/// `POST /api/login` — rate-limited; sets the session cookie on success.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    client_ip: ClientIp,
    headers: HeaderMap,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<Value>)> {
    if !state.sessions.record_login_attempt(&client_ip.0) {
        return Err(ChatvaultError::RateLimited.into());
    }

    let (role, username, allowed_chat_ids) = if let Some(account) =
        state.admin.verify_login(&req.username, &req.password).await?
    {
        (Role::Viewer, account.username, account.allowed_chat_ids)
    } else if auth::verify_master(&state.config.auth, &req.username, &req.password) {
        (Role::Master, req.username.clone(), None)
    } else {
        warn!(ip = %client_ip.0, username = %req.username, "login failed");
        let _ = state
            .admin
            .record_audit(
                &req.username,
                Role::Viewer,
                "login_failed",
                Some("/api/login"),
                None,
                Some(&client_ip.0),
                headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok()),
            )
            .await;
        return Err(ChatvaultError::Unauthenticated.into());
    };

    let allowed_set = allowed_chat_ids.map(|ids| ids.into_iter().collect());
    let session = state.sessions.create_session(&username, role, allowed_set);
    info!(username = %username, role = %role, "login succeeded");
    let _ = state
        .admin
        .record_audit(
            &username,
            role,
            "login_success",
            Some("/api/login"),
            None,
            Some(&client_ip.0),
            headers.get("user-agent").and_then(|v| v.to_str().ok()),
        )
        .await;

    let secure = auth::wants_secure_cookie(&headers, state.config.auth.secure_cookies);
    let cookie = auth::build_session_cookie(session.token, secure, state.config.auth_session_seconds());
    let jar = jar.add(cookie);

    Ok((jar, Json(json!({ "role": role, "username": username }))))
}

/// `POST /api/logout`
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, Json<Value>) {
    if let Some(cookie) = jar.get(chatvault_core::config::AUTH_COOKIE_NAME) {
        let token = cookie.value().to_string();
        if let Ok(ctx) = state.sessions.validate(&token) {
            let _ = state
                .admin
                .record_audit(&ctx.username, ctx.role, "logout", Some("/api/logout"), None, None, None)
                .await;
        }
        state.sessions.delete(&token);
    }
    let jar = jar.add(auth::clearing_cookie());
    (jar, Json(json!({ "ok": true })))
}
