use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use chatvault_core::config::{MAX_CHATS_PAGE, MAX_MESSAGES_PAGE};
use chatvault_core::error::ChatvaultError;
use chatvault_storage::{ChatListFilter, MessagePageFilter};
use chrono::TimeZone;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::app::AppState;
use crate::auth::resolve_caller;
use crate::error::{ApiError, ApiResult};

/// Reject with 403 before any storage call when the chat falls outside the
/// caller's effective scope — the "guard" strategy from the façade contract.
fn guard_chat(scope: &chatvault_core::types::Scope, chat_id: i64) -> ApiResult<()> {
    if chatvault_core::types::scope_allows(scope, chat_id) {
        Ok(())
    } else {
        Err(ChatvaultError::Forbidden(format!("chat {chat_id} not in scope")).into())
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub search: Option<String>,
    pub archived: Option<bool>,
    pub folder_id: Option<i64>,
}

fn default_limit() -> u32 {
    100
}

/// `GET /api/chats`
pub async fn list_chats_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(q): Query<ChatListQuery>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    let limit = q.limit.min(MAX_CHATS_PAGE);

    let allow_ids: Option<Vec<i64>> = scope.as_ref().map(|s| s.iter().copied().collect());
    let filter = ChatListFilter {
        search: q.search.as_deref(),
        archived: q.archived,
        folder_id: q.folder_id,
        allow_ids: allow_ids.as_deref(),
    };

    let page = state.storage.list_chats(limit, q.offset, filter).await?;

    let mut chats = Vec::with_capacity(page.chats.len());
    for chat in page.chats {
        let avatar_url = state
            .avatar_cache
            .resolve(&state.media_root, chat.id)
            .await
            .and_then(|path| path.strip_prefix(&state.media_root).ok().map(|p| p.to_path_buf()))
            .map(|rel| format!("/media/{}", rel.to_string_lossy()));
        chats.push(json!({
            "id": chat.id,
            "type": chat.kind,
            "title": chat.title,
            "username": chat.username,
            "archived": chat.archived,
            "folder_id": chat.folder_id,
            "last_message_date": chat.last_message_date,
            "avatar_url": avatar_url,
        }));
    }

    let has_more = (q.offset as i64 + chats.len() as i64) < page.total;
    Ok(axum::Json(json!({
        "chats": chats,
        "total": page.total,
        "limit": limit,
        "offset": q.offset,
        "has_more": has_more,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_message_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    pub search: Option<String>,
    pub before_date: Option<String>,
    pub before_id: Option<i64>,
    pub topic_id: Option<i64>,
}

fn default_message_limit() -> u32 {
    50
}

/// Parse a caller-supplied `before_date` as ISO-8601 with an optional
/// trailing `Z`, stripping timezone before use (storage dates are naive UTC).
fn parse_before_date(raw: &str) -> ApiResult<chrono::NaiveDateTime> {
    let trimmed = raw.trim_end_matches('Z');
    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| ChatvaultError::BadRequest(format!("invalid before_date: {raw}")).into())
}

/// `GET /api/chats/{id}/messages`
pub async fn chat_messages_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let before_date = q.before_date.as_deref().map(parse_before_date).transpose()?;
    let limit = q.limit.min(MAX_MESSAGES_PAGE);

    let filter = MessagePageFilter {
        search: q.search.as_deref(),
        before_date,
        before_id: q.before_id,
        topic_id: q.topic_id,
    };
    let messages = state
        .storage
        .get_messages_paginated(chat_id, limit, q.offset, filter)
        .await?;

    Ok(axum::Json(json!({ "messages": messages, "limit": limit, "offset": q.offset })))
}

/// `GET /api/chats/{id}/pinned`
pub async fn pinned_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let mut pinned = state.storage.get_pinned(chat_id).await?;
    pinned.sort_by(|a, b| b.date.cmp(&a.date));
    Ok(axum::Json(json!({ "messages": pinned })))
}

/// `GET /api/folders`
pub async fn folders_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    resolve_caller(&jar, &state)?;
    let folders = state.storage.get_folders().await?;
    Ok(axum::Json(json!({ "folders": folders })))
}

/// `GET /api/chats/{id}/topics`
pub async fn topics_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let topics = state.storage.get_topics(chat_id).await?;
    Ok(axum::Json(json!({ "topics": topics })))
}

/// `GET /api/archived/count`
pub async fn archived_count_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    let allow_ids: Option<Vec<i64>> = scope.map(|s| s.into_iter().collect());
    let count = state.storage.count_archived(allow_ids.as_deref()).await?;
    Ok(axum::Json(json!({ "count": count })))
}

#[derive(Debug, Deserialize)]
pub struct ByDateQuery {
    date: String,
    timezone: Option<String>,
}

/// `GET /api/chats/{id}/messages/by-date`
pub async fn messages_by_date_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
    Query(q): Query<ByDateQuery>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let naive_date = chrono::NaiveDate::parse_from_str(&q.date, "%Y-%m-%d")
        .map_err(|_| ApiError::from(ChatvaultError::BadRequest(format!("invalid date: {}", q.date))))?;

    let tz: chrono_tz::Tz = q
        .timezone
        .as_deref()
        .and_then(|s| s.parse().ok())
        .or_else(|| state.config.viewer_timezone.parse().ok())
        .unwrap_or(chrono_tz::UTC);

    let local_midnight = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ApiError::from(ChatvaultError::BadRequest(format!("invalid date: {}", q.date))))?;
    let target_utc = tz
        .from_local_datetime(&local_midnight)
        .earliest()
        .unwrap_or_else(|| chrono::Utc.from_utc_datetime(&local_midnight).with_timezone(&tz))
        .with_timezone(&chrono::Utc)
        .naive_utc();

    match state.storage.find_message_by_date(chat_id, target_utc).await? {
        Some(message) => Ok(axum::Json(json!({ "message": message }))),
        None => Err(ChatvaultError::NotFound(format!("no message on or after {}", q.date)).into()),
    }
}

/// `GET /api/chats/{id}/export` — streams a JSON array body without
/// buffering the whole chat in memory.
pub async fn export_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
) -> ApiResult<Response> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let chat = state
        .storage
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| ApiError::from(ChatvaultError::NotFound(format!("chat {chat_id}"))))?;

    let title = chat.title.clone().unwrap_or_else(|| chat_id.to_string());
    let filename_ascii = format!("chat_{chat_id}_export.json");
    let filename_star = urlencoding::encode(&format!("{title}.json"));

    let mut stream = state.storage.iter_messages_for_export(chat_id);
    let body_stream = async_stream::stream! {
        yield Ok::<_, std::io::Error>(axum::body::Bytes::from_static(b"["));
        let mut first = true;
        while let Some(item) = stream.next().await {
            match item {
                Ok(message) => {
                    let mut chunk = Vec::new();
                    if !first {
                        chunk.push(b',');
                    }
                    first = false;
                    if serde_json::to_writer(&mut chunk, &message).is_err() {
                        continue;
                    }
                    yield Ok(axum::body::Bytes::from(chunk));
                }
                Err(e) => {
                    tracing::error!(error = %e, chat_id, "export stream aborted");
                    break;
                }
            }
        }
        yield Ok(axum::body::Bytes::from_static(b"]"));
    };

    let body = axum::body::Body::from_stream(body_stream);
    let disposition = format!(
        "attachment; filename=\"{filename_ascii}\"; filename*=UTF-8''{filename_star}"
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// `GET /api/chats/{id}/stats`
pub async fn chat_stats_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(chat_id): Path<i64>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    let caller = resolve_caller(&jar, &state)?;
    let scope = state.scope.effective_scope(&caller);
    guard_chat(&scope, chat_id)?;

    let stats = state.storage.get_chat_stats(chat_id).await?;
    Ok(axum::Json(json!({ "stats": stats })))
}
