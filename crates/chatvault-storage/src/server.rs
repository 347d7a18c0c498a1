//! Server-deployment backend (PostgreSQL via `sqlx`).
//!
//! Change events ride Postgres `LISTEN/NOTIFY`: the archiver that ingests
//! messages into this database issues `pg_notify('chatvault_changes', <json>)`
//! in the same transaction as its write, so a dropped listener never loses an
//! event that committed before the drop — it only loses events that arrive
//! while disconnected, which the real-time bridge's resubscribe-on-reconnect
//! handles. `apply_message_edit`/`delete_message` below are the bridge's own
//! post-mass-op-protection writes; they must not notify themselves, since the
//! bridge already re-broadcasts an applied mutation on its in-process
//! outbound channel and a self-notify would feed straight back into the same
//! listener, reapplying forever.

use async_trait::async_trait;
use chatvault_core::error::{ChatvaultError, Result};
use chatvault_core::types::{
    AuditEntry, Chat, ChatStats, ChatType, Folder, MediaType, Message, PushSubscription, Role,
    Topic, ViewerAccount,
};
use chatvault_protocol::ChangeEvent;
use futures_util::stream::BoxStream;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use crate::{ChatListFilter, ChatPage, MessagePageFilter, NewAuditEntry, StorageAdapter};

const NOTIFY_CHANNEL: &str = "chatvault_changes";
const CHANGE_EVENT_CAPACITY: usize = 256;

pub struct ServerStorage {
    pool: PgPool,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl ServerStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| ChatvaultError::Storage(e.to_string()))?;
        init_schema(&pool).await?;
        let (change_tx, _) = broadcast::channel(CHANGE_EVENT_CAPACITY);
        let storage = Self { pool, change_tx };
        storage.spawn_listener();
        Ok(storage)
    }

    /// Runs for the lifetime of the process, reconnecting with backoff if
    /// the listener connection drops.
    fn spawn_listener(&self) {
        let pool = self.pool.clone();
        let tx = self.change_tx.clone();
        tokio::spawn(async move {
            let mut backoff_secs = 1u64;
            loop {
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
                            warn!(error = %e, "failed to LISTEN on notify channel");
                        } else {
                            backoff_secs = 1;
                            loop {
                                match listener.recv().await {
                                    Ok(notification) => {
                                        match serde_json::from_str::<ChangeEvent>(
                                            notification.payload(),
                                        ) {
                                            Ok(event) => {
                                                let _ = tx.send(event);
                                            }
                                            Err(e) => warn!(error = %e, "malformed change notification"),
                                        }
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "postgres listener connection lost");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to establish postgres listener"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(30);
            }
        });
    }

}

async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chats (
            id BIGINT PRIMARY KEY,
            type TEXT NOT NULL,
            title TEXT,
            username TEXT,
            avatar_photo_id BIGINT,
            archived BOOLEAN NOT NULL DEFAULT FALSE,
            folder_id BIGINT,
            last_message_date TIMESTAMP NOT NULL,
            last_synced_message_id BIGINT NOT NULL DEFAULT 0
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            chat_id BIGINT NOT NULL,
            id BIGINT NOT NULL,
            sender_id BIGINT,
            date TIMESTAMP NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            reply_to_msg_id BIGINT,
            forward_from_id BIGINT,
            edit_date TIMESTAMP,
            media_type TEXT,
            media_id TEXT,
            media_path TEXT,
            topic_id BIGINT,
            is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
            is_outgoing BOOLEAN NOT NULL DEFAULT FALSE,
            raw JSONB,
            PRIMARY KEY (chat_id, id)
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_date ON messages(chat_id, date, id)")
        .execute(pool)
        .await
        .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS folders (id BIGINT PRIMARY KEY, title TEXT NOT NULL)",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS topics (
            id BIGINT PRIMARY KEY, chat_id BIGINT NOT NULL, title TEXT NOT NULL
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query("CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS viewer_accounts (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            allowed_chat_ids JSONB,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_by TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL,
            role TEXT NOT NULL,
            action TEXT NOT NULL,
            endpoint TEXT,
            chat_id BIGINT,
            ip_address TEXT,
            user_agent TEXT,
            timestamp TIMESTAMP NOT NULL
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS push_subscriptions (
            endpoint TEXT PRIMARY KEY,
            p256dh TEXT NOT NULL,
            auth_secret TEXT NOT NULL,
            username TEXT,
            allowed_chat_ids JSONB,
            user_agent TEXT,
            created_at TIMESTAMP NOT NULL
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

    Ok(())
}

fn row_to_chat(row: &sqlx::postgres::PgRow) -> std::result::Result<Chat, sqlx::Error> {
    let kind: String = row.try_get("type")?;
    Ok(Chat {
        id: row.try_get("id")?,
        kind: kind.parse().unwrap_or(ChatType::Private),
        title: row.try_get("title")?,
        username: row.try_get("username")?,
        avatar_photo_id: row.try_get("avatar_photo_id")?,
        archived: row.try_get("archived")?,
        folder_id: row.try_get("folder_id")?,
        last_message_date: row.try_get("last_message_date")?,
        last_synced_message_id: row.try_get("last_synced_message_id")?,
    })
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> std::result::Result<Message, sqlx::Error> {
    let media_type: Option<String> = row.try_get("media_type")?;
    let raw: Option<serde_json::Value> = row.try_get("raw")?;
    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        sender_id: row.try_get("sender_id")?,
        date: row.try_get("date")?,
        text: row.try_get("text")?,
        reply_to_msg_id: row.try_get("reply_to_msg_id")?,
        forward_from_id: row.try_get("forward_from_id")?,
        edit_date: row.try_get("edit_date")?,
        media_type: media_type.and_then(|m| parse_media_type(&m)),
        media_id: row.try_get("media_id")?,
        media_path: row.try_get("media_path")?,
        topic_id: row.try_get("topic_id")?,
        is_pinned: row.try_get("is_pinned")?,
        is_outgoing: row.try_get("is_outgoing")?,
        raw,
    })
}

fn parse_media_type(s: &str) -> Option<MediaType> {
    Some(match s {
        "photo" => MediaType::Photo,
        "video" => MediaType::Video,
        "voice" => MediaType::Voice,
        "video_note" => MediaType::VideoNote,
        "audio" => MediaType::Audio,
        "animation" => MediaType::Animation,
        "sticker" => MediaType::Sticker,
        "document" => MediaType::Document,
        _ => return None,
    })
}

fn row_to_viewer(row: &sqlx::postgres::PgRow) -> std::result::Result<ViewerAccount, sqlx::Error> {
    let allowed: Option<serde_json::Value> = row.try_get("allowed_chat_ids")?;
    Ok(ViewerAccount {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        salt: row.try_get("salt")?,
        allowed_chat_ids: allowed.and_then(|v| serde_json::from_value(v).ok()),
        is_active: row.try_get("is_active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_audit(row: &sqlx::postgres::PgRow) -> std::result::Result<AuditEntry, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        role: if role == "master" { Role::Master } else { Role::Viewer },
        action: row.try_get("action")?,
        endpoint: row.try_get("endpoint")?,
        chat_id: row.try_get("chat_id")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn row_to_push_sub(
    row: &sqlx::postgres::PgRow,
) -> std::result::Result<PushSubscription, sqlx::Error> {
    let allowed: Option<serde_json::Value> = row.try_get("allowed_chat_ids")?;
    Ok(PushSubscription {
        endpoint: row.try_get("endpoint")?,
        p256dh: row.try_get("p256dh")?,
        auth_secret: row.try_get("auth_secret")?,
        username: row.try_get("username")?,
        allowed_chat_ids: allowed.and_then(|v| serde_json::from_value(v).ok()),
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    })
}

fn storage_err(e: sqlx::Error) -> ChatvaultError {
    ChatvaultError::Storage(e.to_string())
}

#[async_trait]
impl StorageAdapter for ServerStorage {
    #[instrument(skip(self))]
    async fn get_chat(&self, chat_id: i64) -> Result<Option<Chat>> {
        sqlx::query("SELECT * FROM chats WHERE id = $1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(|r| row_to_chat(&r).map_err(storage_err))
            .transpose()
    }

    async fn list_chats(
        &self,
        limit: u32,
        offset: u32,
        filter: ChatListFilter<'_>,
    ) -> Result<ChatPage> {
        if let Some(ids) = filter.allow_ids {
            if ids.is_empty() {
                return Ok(ChatPage { chats: Vec::new(), total: 0 });
            }
        }

        let mut where_clauses: Vec<String> = Vec::new();
        let mut n = 1;
        if filter.search.is_some() {
            where_clauses.push(format!("LOWER(title) LIKE ${n}"));
            n += 1;
        }
        if filter.archived.is_some() {
            where_clauses.push(format!("archived = ${n}"));
            n += 1;
        }
        if filter.folder_id.is_some() {
            where_clauses.push(format!("folder_id = ${n}"));
            n += 1;
        }
        if let Some(ids) = filter.allow_ids {
            let placeholders = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            where_clauses.push(format!("id IN ({placeholders})"));
        }
        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let mut count_q = sqlx::query(&format!("SELECT COUNT(*) AS n FROM chats {where_sql}"));
        let mut list_q = sqlx::query(&format!(
            "SELECT * FROM chats {where_sql} ORDER BY last_message_date DESC LIMIT ${n} OFFSET ${}",
            n + 1
        ));
        if let Some(s) = filter.search {
            let pattern = format!("%{}%", s.to_lowercase());
            count_q = count_q.bind(pattern.clone());
            list_q = list_q.bind(pattern);
        }
        if let Some(a) = filter.archived {
            count_q = count_q.bind(a);
            list_q = list_q.bind(a);
        }
        if let Some(f) = filter.folder_id {
            count_q = count_q.bind(f);
            list_q = list_q.bind(f);
        }
        list_q = list_q.bind(limit as i64).bind(offset as i64);

        let total: i64 = count_q
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;
        let rows = list_q.fetch_all(&self.pool).await.map_err(storage_err)?;
        let chats = rows
            .iter()
            .filter_map(|r| row_to_chat(r).ok())
            .collect();

        Ok(ChatPage { chats, total })
    }

    async fn count_archived(&self, allow_ids: Option<&[i64]>) -> Result<i64> {
        if let Some(ids) = allow_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            let placeholders = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
            let sql = format!("SELECT COUNT(*) AS n FROM chats WHERE archived = TRUE AND id IN ({placeholders})");
            let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(storage_err)?;
            return row.try_get::<i64, _>("n").map_err(storage_err);
        }
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chats WHERE archived = TRUE")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        row.try_get::<i64, _>("n").map_err(storage_err)
    }

    async fn get_messages_paginated(
        &self,
        chat_id: i64,
        limit: u32,
        offset: u32,
        filter: MessagePageFilter<'_>,
    ) -> Result<Vec<Message>> {
        let mut where_clauses = vec!["chat_id = $1".to_string()];
        let mut n = 2;
        if filter.search.is_some() {
            where_clauses.push(format!("LOWER(text) LIKE ${n}"));
            n += 1;
        }
        if filter.topic_id.is_some() {
            where_clauses.push(format!("topic_id = ${n}"));
            n += 1;
        }
        let use_cursor = filter.before_date.is_some() && filter.before_id.is_some();
        if use_cursor {
            where_clauses.push(format!(
                "(date < ${n} OR (date = ${n} AND id < ${}))",
                n + 1
            ));
            n += 2;
        }
        let mut sql = format!(
            "SELECT * FROM messages WHERE {} ORDER BY date DESC, id DESC LIMIT ${n}",
            where_clauses.join(" AND ")
        );
        n += 1;
        if !use_cursor {
            sql.push_str(&format!(" OFFSET ${n}"));
        }

        let mut q = sqlx::query(&sql).bind(chat_id);
        if let Some(s) = filter.search {
            q = q.bind(format!("%{}%", s.to_lowercase()));
        }
        if let Some(t) = filter.topic_id {
            q = q.bind(t);
        }
        if use_cursor {
            let bd = filter.before_date.unwrap();
            q = q.bind(bd).bind(filter.before_id.unwrap());
        }
        q = q.bind(limit as i64);
        if !use_cursor {
            q = q.bind(offset as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(storage_err)?;
        Ok(rows.iter().filter_map(|r| row_to_message(r).ok()).collect())
    }

    async fn find_message_by_date(
        &self,
        chat_id: i64,
        date_utc: chrono::NaiveDateTime,
    ) -> Result<Option<Message>> {
        sqlx::query(
            "SELECT * FROM messages WHERE chat_id = $1 AND date >= $2 ORDER BY date ASC LIMIT 1",
        )
        .bind(chat_id)
        .bind(date_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?
        .map(|r| row_to_message(&r).map_err(storage_err))
        .transpose()
    }

    async fn get_pinned(&self, chat_id: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE chat_id = $1 AND is_pinned = TRUE ORDER BY date DESC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().filter_map(|r| row_to_message(r).ok()).collect())
    }

    async fn get_folders(&self) -> Result<Vec<Folder>> {
        let rows = sqlx::query(
            "SELECT f.id, f.title, COUNT(c.id) AS chat_count
             FROM folders f LEFT JOIN chats c ON c.folder_id = f.id
             GROUP BY f.id, f.title ORDER BY f.title",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                Ok(Folder {
                    id: r.try_get("id").map_err(storage_err)?,
                    title: r.try_get("title").map_err(storage_err)?,
                    chat_count: r.try_get("chat_count").map_err(storage_err)?,
                })
            })
            .collect()
    }

    async fn get_topics(&self, chat_id: i64) -> Result<Vec<Topic>> {
        let rows = sqlx::query("SELECT id, chat_id, title FROM topics WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|r| {
                Ok(Topic {
                    id: r.try_get("id").map_err(storage_err)?,
                    chat_id: r.try_get("chat_id").map_err(storage_err)?,
                    title: r.try_get("title").map_err(storage_err)?,
                })
            })
            .collect()
    }

    async fn get_chat_stats(&self, chat_id: i64) -> Result<ChatStats> {
        let row = sqlx::query(
            "SELECT $1::bigint AS chat_id,
                    COUNT(*) AS message_count,
                    COUNT(*) FILTER (WHERE media_type IS NOT NULL) AS media_count,
                    MIN(date) AS first_message_date,
                    MAX(date) AS last_message_date
             FROM messages WHERE chat_id = $1",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(ChatStats {
            chat_id: row.try_get("chat_id").map_err(storage_err)?,
            message_count: row.try_get("message_count").map_err(storage_err)?,
            media_count: row.try_get("media_count").map_err(storage_err)?,
            first_message_date: row.try_get("first_message_date").map_err(storage_err)?,
            last_message_date: row.try_get("last_message_date").map_err(storage_err)?,
        })
    }

    async fn get_cached_statistics(&self) -> Result<serde_json::Value> {
        let raw = self.get_metadata("cached_statistics").await?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn calculate_and_store_statistics(&self) -> Result<()> {
        let total_chats: i64 = sqlx::query("SELECT COUNT(*) AS n FROM chats")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;
        let total_messages: i64 = sqlx::query("SELECT COUNT(*) AS n FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?
            .try_get("n")
            .map_err(storage_err)?;
        let stats = serde_json::json!({
            "total_chats": total_chats,
            "total_messages": total_messages,
        });
        self.set_metadata(
            "cached_statistics",
            &serde_json::to_string(&stats).map_err(|e| ChatvaultError::Internal(e.to_string()))?,
        )
        .await?;
        let now = chrono::Utc::now().naive_utc().to_string();
        self.set_metadata("stats_calculated_at", &now).await
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        sqlx::query("SELECT value FROM metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(|r| r.try_get("value").map_err(storage_err))
            .transpose()
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    fn iter_messages_for_export(&self, chat_id: i64) -> BoxStream<'static, Result<Message>> {
        let pool = self.pool.clone();
        Box::pin(async_stream::try_stream! {
            const PAGE: i64 = 500;
            let mut after_id: i64 = -1;
            loop {
                let rows = sqlx::query(
                    "SELECT * FROM messages WHERE chat_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
                )
                .bind(chat_id)
                .bind(after_id)
                .bind(PAGE)
                .fetch_all(&pool)
                .await
                .map_err(storage_err)?;

                if rows.is_empty() {
                    break;
                }
                let mapped: Vec<Message> = rows.iter().filter_map(|r| row_to_message(r).ok()).collect();
                after_id = mapped.last().map(|m| m.id).unwrap_or(after_id);
                for msg in mapped {
                    yield msg;
                }
            }
        })
    }

    async fn apply_message_edit(
        &self,
        chat_id: i64,
        message_id: i64,
        new_text: &str,
        edit_date: chrono::NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET text = $1, edit_date = $2 WHERE chat_id = $3 AND id = $4",
        )
        .bind(new_text)
        .bind(edit_date)
        .bind(chat_id)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE chat_id = $1 AND id = $2")
            .bind(chat_id)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_viewer_account(&self, id: i64) -> Result<Option<ViewerAccount>> {
        sqlx::query("SELECT * FROM viewer_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(|r| row_to_viewer(&r).map_err(storage_err))
            .transpose()
    }

    async fn get_viewer_by_username(&self, username: &str) -> Result<Option<ViewerAccount>> {
        sqlx::query("SELECT * FROM viewer_accounts WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?
            .map(|r| row_to_viewer(&r).map_err(storage_err))
            .transpose()
    }

    async fn list_viewer_accounts(&self) -> Result<Vec<ViewerAccount>> {
        let rows = sqlx::query("SELECT * FROM viewer_accounts ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(|r| row_to_viewer(r).map_err(storage_err)).collect()
    }

    async fn create_viewer_account(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        allowed_chat_ids: Option<&[i64]>,
        created_by: &str,
    ) -> Result<ViewerAccount> {
        let now = chrono::Utc::now().naive_utc();
        let allowed_json = allowed_chat_ids.map(|ids| serde_json::to_value(ids).unwrap());
        let row = sqlx::query(
            "INSERT INTO viewer_accounts
             (username, password_hash, salt, allowed_chat_ids, is_active, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, TRUE, $5, $6, $6)
             RETURNING *",
        )
        .bind(username)
        .bind(password_hash)
        .bind(salt)
        .bind(allowed_json)
        .bind(created_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        row_to_viewer(&row).map_err(storage_err)
    }

    async fn update_viewer_account(
        &self,
        id: i64,
        password_hash: Option<&str>,
        salt: Option<&str>,
        allowed_chat_ids: Option<Option<&[i64]>>,
        is_active: Option<bool>,
    ) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        if let Some(pw) = password_hash {
            sqlx::query("UPDATE viewer_accounts SET password_hash = $1, updated_at = $2 WHERE id = $3")
                .bind(pw).bind(now).bind(id)
                .execute(&self.pool).await.map_err(storage_err)?;
        }
        if let Some(s) = salt {
            sqlx::query("UPDATE viewer_accounts SET salt = $1, updated_at = $2 WHERE id = $3")
                .bind(s).bind(now).bind(id)
                .execute(&self.pool).await.map_err(storage_err)?;
        }
        if let Some(allowed) = allowed_chat_ids {
            let allowed_json = allowed.map(|ids| serde_json::to_value(ids).unwrap());
            sqlx::query("UPDATE viewer_accounts SET allowed_chat_ids = $1, updated_at = $2 WHERE id = $3")
                .bind(allowed_json).bind(now).bind(id)
                .execute(&self.pool).await.map_err(storage_err)?;
        }
        if let Some(active) = is_active {
            sqlx::query("UPDATE viewer_accounts SET is_active = $1, updated_at = $2 WHERE id = $3")
                .bind(active).bind(now).bind(id)
                .execute(&self.pool).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn delete_viewer_account(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM viewer_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn create_audit_log(&self, entry: NewAuditEntry<'_>) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO audit_log (username, role, action, endpoint, chat_id, ip_address, user_agent, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.username)
        .bind(entry.role.to_string())
        .bind(entry.action)
        .bind(entry.endpoint)
        .bind(entry.chat_id)
        .bind(entry.ip_address)
        .bind(entry.user_agent)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_audit_logs(
        &self,
        limit: u32,
        offset: u32,
        username: Option<&str>,
    ) -> Result<(Vec<AuditEntry>, i64)> {
        let (total, rows) = if let Some(u) = username {
            let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM audit_log WHERE username = $1")
                .bind(u)
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?
                .try_get("n")
                .map_err(storage_err)?;
            let rows = sqlx::query(
                "SELECT * FROM audit_log WHERE username = $1 ORDER BY timestamp DESC LIMIT $2 OFFSET $3",
            )
            .bind(u)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
            (total, rows)
        } else {
            let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM audit_log")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_err)?
                .try_get("n")
                .map_err(storage_err)?;
            let rows = sqlx::query(
                "SELECT * FROM audit_log ORDER BY timestamp DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
            (total, rows)
        };
        let entries = rows.iter().map(|r| row_to_audit(r).map_err(storage_err)).collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    async fn upsert_push_subscription(&self, sub: &PushSubscription) -> Result<()> {
        let allowed_json = sub.allowed_chat_ids.as_ref().map(|ids| serde_json::to_value(ids).unwrap());
        sqlx::query(
            "INSERT INTO push_subscriptions
             (endpoint, p256dh, auth_secret, username, allowed_chat_ids, user_agent, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (endpoint) DO UPDATE SET
                p256dh = excluded.p256dh,
                auth_secret = excluded.auth_secret,
                username = excluded.username,
                allowed_chat_ids = excluded.allowed_chat_ids,
                user_agent = excluded.user_agent",
        )
        .bind(&sub.endpoint)
        .bind(&sub.p256dh)
        .bind(&sub.auth_secret)
        .bind(&sub.username)
        .bind(allowed_json)
        .bind(&sub.user_agent)
        .bind(sub.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<()> {
        sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = $1")
            .bind(endpoint)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        let rows = sqlx::query("SELECT * FROM push_subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(|r| row_to_push_sub(r).map_err(storage_err)).collect()
    }

    fn change_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }
}
