//! Embedded single-file backend (SQLite via `rusqlite`).
//!
//! Change events for this backend do not come from the database itself —
//! SQLite has no pub/sub — they arrive over the loop-back-only
//! `/internal/push` HTTP route and are published onto `change_tx` by
//! [`EmbeddedStorage::publish_change_event`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatvault_core::error::{ChatvaultError, Result};
use chatvault_core::types::{
    AuditEntry, Chat, ChatStats, ChatType, Folder, Media, MediaType, Message, PushSubscription,
    Role, Topic, ViewerAccount,
};
use chatvault_protocol::ChangeEvent;
use futures_util::stream::BoxStream;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;

use crate::{ChatListFilter, ChatPage, MessagePageFilter, NewAuditEntry, StorageAdapter};

const CHANGE_EVENT_CAPACITY: usize = 256;

pub struct EmbeddedStorage {
    db: Arc<Mutex<Connection>>,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl EmbeddedStorage {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).map_err(|e| ChatvaultError::Storage(e.to_string()))?;
        init_db(&conn).map_err(|e| ChatvaultError::Storage(e.to_string()))?;
        let (change_tx, _) = broadcast::channel(CHANGE_EVENT_CAPACITY);
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            change_tx,
        })
    }

    /// Feed a change event notified via the loop-back ingest endpoint into
    /// the shared broadcast channel the real-time bridge subscribes to.
    pub fn publish_change_event(&self, event: ChangeEvent) {
        let _ = self.change_tx.send(event);
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap();
            f(&conn)
        })
        .await
        .map_err(|e| ChatvaultError::Internal(e.to_string()))?
        .map_err(|e| ChatvaultError::Storage(e.to_string()))
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY,
            type TEXT NOT NULL,
            title TEXT,
            username TEXT,
            avatar_photo_id INTEGER,
            archived INTEGER NOT NULL DEFAULT 0,
            folder_id INTEGER,
            last_message_date TEXT NOT NULL,
            last_synced_message_id INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS messages (
            chat_id INTEGER NOT NULL,
            id INTEGER NOT NULL,
            sender_id INTEGER,
            date TEXT NOT NULL,
            text TEXT NOT NULL DEFAULT '',
            reply_to_msg_id INTEGER,
            forward_from_id INTEGER,
            edit_date TEXT,
            media_type TEXT,
            media_id TEXT,
            media_path TEXT,
            topic_id INTEGER,
            is_pinned INTEGER NOT NULL DEFAULT 0,
            is_outgoing INTEGER NOT NULL DEFAULT 0,
            raw TEXT,
            PRIMARY KEY (chat_id, id)
         );
         CREATE INDEX IF NOT EXISTS idx_messages_chat_date ON messages(chat_id, date, id);
         CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY,
            chat_id INTEGER NOT NULL,
            title TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS viewer_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            salt TEXT NOT NULL,
            allowed_chat_ids TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            role TEXT NOT NULL,
            action TEXT NOT NULL,
            endpoint TEXT,
            chat_id INTEGER,
            ip_address TEXT,
            user_agent TEXT,
            timestamp TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_audit_username ON audit_log(username);
         CREATE TABLE IF NOT EXISTS push_subscriptions (
            endpoint TEXT PRIMARY KEY,
            p256dh TEXT NOT NULL,
            auth_secret TEXT NOT NULL,
            username TEXT,
            allowed_chat_ids TEXT,
            user_agent TEXT,
            created_at TEXT NOT NULL
         );",
    )
}

fn row_to_chat(row: &Row<'_>) -> rusqlite::Result<Chat> {
    let kind: String = row.get("type")?;
    Ok(Chat {
        id: row.get("id")?,
        kind: kind.parse().unwrap_or(ChatType::Private),
        title: row.get("title")?,
        username: row.get("username")?,
        avatar_photo_id: row.get("avatar_photo_id")?,
        archived: row.get::<_, i64>("archived")? != 0,
        folder_id: row.get("folder_id")?,
        last_message_date: row.get("last_message_date")?,
        last_synced_message_id: row.get("last_synced_message_id")?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let media_type: Option<String> = row.get("media_type")?;
    let raw: Option<String> = row.get("raw")?;
    Ok(Message {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        sender_id: row.get("sender_id")?,
        date: row.get("date")?,
        text: row.get("text")?,
        reply_to_msg_id: row.get("reply_to_msg_id")?,
        forward_from_id: row.get("forward_from_id")?,
        edit_date: row.get("edit_date")?,
        media_type: media_type.and_then(|m| parse_media_type(&m)),
        media_id: row.get("media_id")?,
        media_path: row.get("media_path")?,
        topic_id: row.get("topic_id")?,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        is_outgoing: row.get::<_, i64>("is_outgoing")? != 0,
        raw: raw.and_then(|r| serde_json::from_str(&r).ok()),
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

fn row_to_viewer(row: &Row<'_>) -> rusqlite::Result<ViewerAccount> {
    let allowed_raw: Option<String> = row.get("allowed_chat_ids")?;
    Ok(ViewerAccount {
        id: row.get("id")?,
        username: row.get("username")?,
        password_hash: row.get("password_hash")?,
        salt: row.get("salt")?,
        allowed_chat_ids: allowed_raw.and_then(|s| serde_json::from_str(&s).ok()),
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let role: String = row.get("role")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        username: row.get("username")?,
        role: if role == "master" {
            Role::Master
        } else {
            Role::Viewer
        },
        action: row.get("action")?,
        endpoint: row.get("endpoint")?,
        chat_id: row.get("chat_id")?,
        ip_address: row.get("ip_address")?,
        user_agent: row.get("user_agent")?,
        timestamp: row.get("timestamp")?,
    })
}

fn row_to_push_sub(row: &Row<'_>) -> rusqlite::Result<PushSubscription> {
    let allowed_raw: Option<String> = row.get("allowed_chat_ids")?;
    Ok(PushSubscription {
        endpoint: row.get("endpoint")?,
        p256dh: row.get("p256dh")?,
        auth_secret: row.get("auth_secret")?,
        username: row.get("username")?,
        allowed_chat_ids: allowed_raw.and_then(|s| serde_json::from_str(&s).ok()),
        user_agent: row.get("user_agent")?,
        created_at: row.get("created_at")?,
    })
}

#[async_trait]
impl StorageAdapter for EmbeddedStorage {
    async fn get_chat(&self, chat_id: i64) -> Result<Option<Chat>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM chats WHERE id = ?1",
                params![chat_id],
                row_to_chat,
            )
            .optional()
        })
        .await
    }

    async fn list_chats(
        &self,
        limit: u32,
        offset: u32,
        filter: ChatListFilter<'_>,
    ) -> Result<ChatPage> {
        let search = filter.search.map(|s| format!("%{}%", s.to_lowercase()));
        let archived = filter.archived;
        let folder_id = filter.folder_id;
        let allow_ids: Option<Vec<i64>> = filter.allow_ids.map(|s| s.to_vec());

        self.with_conn(move |conn| {
            if let Some(ids) = &allow_ids {
                if ids.is_empty() {
                    return Ok(ChatPage {
                        chats: Vec::new(),
                        total: 0,
                    });
                }
            }

            let mut where_clauses: Vec<String> = Vec::new();
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(s) = &search {
                where_clauses.push("LOWER(title) LIKE ?".to_string());
                bind.push(Box::new(s.clone()));
            }
            if let Some(a) = archived {
                where_clauses.push("archived = ?".to_string());
                bind.push(Box::new(a as i64));
            }
            if let Some(f) = folder_id {
                where_clauses.push("folder_id = ?".to_string());
                bind.push(Box::new(f));
            }
            if let Some(ids) = &allow_ids {
                let placeholders = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                where_clauses.push(format!("id IN ({placeholders})"));
            }
            let where_sql = if where_clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", where_clauses.join(" AND "))
            };

            let count_sql = format!("SELECT COUNT(*) FROM chats {where_sql}");
            let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
            let total: i64 =
                conn.query_row(&count_sql, bind_refs.as_slice(), |r| r.get(0))?;

            let list_sql = format!(
                "SELECT * FROM chats {where_sql} ORDER BY last_message_date DESC LIMIT ? OFFSET ?"
            );
            let mut list_bind = bind;
            list_bind.push(Box::new(limit as i64));
            list_bind.push(Box::new(offset as i64));
            let list_bind_refs: Vec<&dyn rusqlite::ToSql> =
                list_bind.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&list_sql)?;
            let chats = stmt
                .query_map(list_bind_refs.as_slice(), row_to_chat)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(ChatPage { chats, total })
        })
        .await
    }

    async fn count_archived(&self, allow_ids: Option<&[i64]>) -> Result<i64> {
        let allow_ids: Option<Vec<i64>> = allow_ids.map(|s| s.to_vec());
        self.with_conn(move |conn| {
            let mut sql = "SELECT COUNT(*) FROM chats WHERE archived = 1".to_string();
            if let Some(ids) = &allow_ids {
                if ids.is_empty() {
                    return Ok(0);
                }
                let placeholders = ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                sql.push_str(&format!(" AND id IN ({placeholders})"));
            }
            conn.query_row(&sql, [], |r| r.get(0))
        })
        .await
    }

    async fn get_messages_paginated(
        &self,
        chat_id: i64,
        limit: u32,
        offset: u32,
        filter: MessagePageFilter<'_>,
    ) -> Result<Vec<Message>> {
        let search = filter.search.map(|s| format!("%{}%", s.to_lowercase()));
        let before_date = filter.before_date;
        let before_id = filter.before_id;
        let topic_id = filter.topic_id;

        self.with_conn(move |conn| {
            let mut sql = "SELECT * FROM messages WHERE chat_id = ?".to_string();
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(chat_id)];

            if let Some(s) = &search {
                sql.push_str(" AND LOWER(text) LIKE ?");
                params_vec.push(Box::new(s.clone()));
            }
            if let Some(t) = topic_id {
                sql.push_str(" AND topic_id = ?");
                params_vec.push(Box::new(t));
            }
            let use_cursor = before_date.is_some() && before_id.is_some();
            if use_cursor {
                sql.push_str(" AND (date < ? OR (date = ? AND id < ?))");
                let bd = before_date.unwrap();
                params_vec.push(Box::new(bd));
                params_vec.push(Box::new(bd));
                params_vec.push(Box::new(before_id.unwrap()));
            }
            sql.push_str(" ORDER BY date DESC, id DESC LIMIT ?");
            params_vec.push(Box::new(limit as i64));
            if !use_cursor {
                sql.push_str(" OFFSET ?");
                params_vec.push(Box::new(offset as i64));
            }

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), row_to_message)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    async fn find_message_by_date(
        &self,
        chat_id: i64,
        date_utc: chrono::NaiveDateTime,
    ) -> Result<Option<Message>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM messages WHERE chat_id = ?1 AND date >= ?2 ORDER BY date ASC LIMIT 1",
                params![chat_id, date_utc],
                row_to_message,
            )
            .optional()
        })
        .await
    }

    async fn get_pinned(&self, chat_id: i64) -> Result<Vec<Message>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE chat_id = ?1 AND is_pinned = 1 ORDER BY date DESC",
            )?;
            let rows = stmt
                .query_map(params![chat_id], row_to_message)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    async fn get_folders(&self) -> Result<Vec<Folder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT f.id, f.title, COUNT(c.id) as chat_count
                 FROM folders f LEFT JOIN chats c ON c.folder_id = f.id
                 GROUP BY f.id, f.title ORDER BY f.title",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Folder {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        chat_count: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    async fn get_topics(&self, chat_id: i64) -> Result<Vec<Topic>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, chat_id, title FROM topics WHERE chat_id = ?1")?;
            let rows = stmt
                .query_map(params![chat_id], |row| {
                    Ok(Topic {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        title: row.get(2)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    async fn get_chat_stats(&self, chat_id: i64) -> Result<ChatStats> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT ?1 as chat_id,
                        COUNT(*) as message_count,
                        SUM(CASE WHEN media_type IS NOT NULL THEN 1 ELSE 0 END) as media_count,
                        MIN(date) as first_message_date,
                        MAX(date) as last_message_date
                 FROM messages WHERE chat_id = ?1",
                params![chat_id],
                |row| {
                    Ok(ChatStats {
                        chat_id: row.get(0)?,
                        message_count: row.get(1)?,
                        media_count: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        first_message_date: row.get(3)?,
                        last_message_date: row.get(4)?,
                    })
                },
            )
        })
        .await
    }

    async fn get_cached_statistics(&self) -> Result<serde_json::Value> {
        let raw = self.get_metadata("cached_statistics").await?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn calculate_and_store_statistics(&self) -> Result<()> {
        let stats = self
            .with_conn(|conn| {
                let total_chats: i64 = conn.query_row("SELECT COUNT(*) FROM chats", [], |r| r.get(0))?;
                let total_messages: i64 =
                    conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
                Ok(serde_json::json!({
                    "total_chats": total_chats,
                    "total_messages": total_messages,
                }))
            })
            .await?;
        self.set_metadata(
            "cached_statistics",
            &serde_json::to_string(&stats).map_err(|e| ChatvaultError::Internal(e.to_string()))?,
        )
        .await?;
        let now = chrono::Utc::now().naive_utc().to_string();
        self.set_metadata("stats_calculated_at", &now).await
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    fn iter_messages_for_export(&self, chat_id: i64) -> BoxStream<'static, Result<Message>> {
        // Streams one page at a time from the worker thread, never holding
        // the whole chat in memory at once.
        let db = self.db.clone();
        Box::pin(async_stream::try_stream! {
            const PAGE: i64 = 500;
            let mut after_id: i64 = -1;
            loop {
                let db = db.clone();
                let rows: Vec<Message> = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<Message>> {
                    let conn = db.lock().unwrap();
                    let mut stmt = conn.prepare(
                        "SELECT * FROM messages WHERE chat_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(params![chat_id, after_id, PAGE], row_to_message)?
                        .filter_map(|r| r.ok())
                        .collect();
                    Ok(rows)
                })
                .await
                .map_err(|e| ChatvaultError::Internal(e.to_string()))?
                .map_err(|e| ChatvaultError::Storage(e.to_string()))?;

                if rows.is_empty() {
                    break;
                }
                after_id = rows.last().map(|m| m.id).unwrap_or(after_id);
                for row in rows {
                    yield row;
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
        let new_text = new_text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE messages SET text = ?1, edit_date = ?2 WHERE chat_id = ?3 AND id = ?4",
                params![new_text, edit_date, chat_id, message_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND id = ?2",
                params![chat_id, message_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_viewer_account(&self, id: i64) -> Result<Option<ViewerAccount>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM viewer_accounts WHERE id = ?1",
                params![id],
                row_to_viewer,
            )
            .optional()
        })
        .await
    }

    async fn get_viewer_by_username(&self, username: &str) -> Result<Option<ViewerAccount>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM viewer_accounts WHERE username = ?1",
                params![username],
                row_to_viewer,
            )
            .optional()
        })
        .await
    }

    async fn list_viewer_accounts(&self) -> Result<Vec<ViewerAccount>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM viewer_accounts ORDER BY username")?;
            let rows = stmt
                .query_map([], row_to_viewer)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    async fn create_viewer_account(
        &self,
        username: &str,
        password_hash: &str,
        salt: &str,
        allowed_chat_ids: Option<&[i64]>,
        created_by: &str,
    ) -> Result<ViewerAccount> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        let salt = salt.to_string();
        let allowed_json = allowed_chat_ids.map(|ids| serde_json::to_string(ids).unwrap());
        let created_by = created_by.to_string();
        self.with_conn(move |conn| {
            let now = chrono::Utc::now().naive_utc();
            conn.execute(
                "INSERT INTO viewer_accounts
                 (username, password_hash, salt, allowed_chat_ids, is_active, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
                params![username, password_hash, salt, allowed_json, created_by, now],
            )?;
            conn.query_row(
                "SELECT * FROM viewer_accounts WHERE username = ?1",
                params![username],
                row_to_viewer,
            )
        })
        .await
    }

    async fn update_viewer_account(
        &self,
        id: i64,
        password_hash: Option<&str>,
        salt: Option<&str>,
        allowed_chat_ids: Option<Option<&[i64]>>,
        is_active: Option<bool>,
    ) -> Result<()> {
        let password_hash = password_hash.map(String::from);
        let salt = salt.map(String::from);
        let allowed_json = allowed_chat_ids.map(|opt| opt.map(|ids| serde_json::to_string(ids).unwrap()));
        self.with_conn(move |conn| {
            let now = chrono::Utc::now().naive_utc();
            if let Some(pw) = &password_hash {
                conn.execute(
                    "UPDATE viewer_accounts SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
                    params![pw, now, id],
                )?;
            }
            if let Some(s) = &salt {
                conn.execute(
                    "UPDATE viewer_accounts SET salt = ?1, updated_at = ?2 WHERE id = ?3",
                    params![s, now, id],
                )?;
            }
            if let Some(allowed) = &allowed_json {
                conn.execute(
                    "UPDATE viewer_accounts SET allowed_chat_ids = ?1, updated_at = ?2 WHERE id = ?3",
                    params![allowed, now, id],
                )?;
            }
            if let Some(active) = is_active {
                conn.execute(
                    "UPDATE viewer_accounts SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                    params![active as i64, now, id],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_viewer_account(&self, id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM viewer_accounts WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn create_audit_log(&self, entry: NewAuditEntry<'_>) -> Result<()> {
        let username = entry.username.to_string();
        let role = entry.role.to_string();
        let action = entry.action.to_string();
        let endpoint = entry.endpoint.map(String::from);
        let chat_id = entry.chat_id;
        let ip_address = entry.ip_address.map(String::from);
        let user_agent = entry.user_agent.map(String::from);
        self.with_conn(move |conn| {
            let now = chrono::Utc::now().naive_utc();
            conn.execute(
                "INSERT INTO audit_log (username, role, action, endpoint, chat_id, ip_address, user_agent, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![username, role, action, endpoint, chat_id, ip_address, user_agent, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_audit_logs(
        &self,
        limit: u32,
        offset: u32,
        username: Option<&str>,
    ) -> Result<(Vec<AuditEntry>, i64)> {
        let username = username.map(String::from);
        self.with_conn(move |conn| {
            let (where_sql, total): (&str, i64) = if username.is_some() {
                (
                    "WHERE username = ?1",
                    conn.query_row(
                        "SELECT COUNT(*) FROM audit_log WHERE username = ?1",
                        params![username],
                        |r| r.get(0),
                    )?,
                )
            } else {
                (
                    "",
                    conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?,
                )
            };

            let sql = format!(
                "SELECT * FROM audit_log {where_sql} ORDER BY timestamp DESC LIMIT {} OFFSET {}",
                limit, offset
            );
            let rows = if let Some(u) = &username {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![u], row_to_audit)?
                    .filter_map(|r| r.ok())
                    .collect()
            } else {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], row_to_audit)?
                    .filter_map(|r| r.ok())
                    .collect()
            };
            Ok((rows, total))
        })
        .await
    }

    async fn upsert_push_subscription(&self, sub: &PushSubscription) -> Result<()> {
        let sub = sub.clone();
        self.with_conn(move |conn| {
            let allowed_json = sub
                .allowed_chat_ids
                .as_ref()
                .map(|ids| serde_json::to_string(ids).unwrap());
            conn.execute(
                "INSERT INTO push_subscriptions
                 (endpoint, p256dh, auth_secret, username, allowed_chat_ids, user_agent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(endpoint) DO UPDATE SET
                    p256dh = excluded.p256dh,
                    auth_secret = excluded.auth_secret,
                    username = excluded.username,
                    allowed_chat_ids = excluded.allowed_chat_ids,
                    user_agent = excluded.user_agent",
                params![
                    sub.endpoint,
                    sub.p256dh,
                    sub.auth_secret,
                    sub.username,
                    allowed_json,
                    sub.user_agent,
                    sub.created_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_push_subscription(&self, endpoint: &str) -> Result<()> {
        let endpoint = endpoint.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM push_subscriptions WHERE endpoint = ?1",
                params![endpoint],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM push_subscriptions")?;
            let rows = stmt
                .query_map([], row_to_push_sub)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .await
    }

    fn change_events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    fn publish_loopback_event(&self, event: ChangeEvent) {
        self.publish_change_event(event);
    }
}
