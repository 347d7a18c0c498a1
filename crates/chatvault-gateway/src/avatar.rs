//! Cached filesystem lookup of per-chat avatar files, backing the
//! `avatar_url` field returned by the chat-listing endpoint.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;

const TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    value: Option<PathBuf>,
    at: Instant,
}

/// Single-writer-per-key cache (a lookup miss just redoes the scan); readers
/// tolerate a brief stale read until the entry ages out.
#[derive(Default)]
pub struct AvatarCache {
    entries: DashMap<i64, CacheEntry>,
}

impl AvatarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the avatar file for `chat_id` under `{media_root}/avatars/chats/`,
    /// picking whichever matching file was modified most recently. Caches the
    /// result (including a miss) for `TTL`.
    pub async fn resolve(&self, media_root: &Path, chat_id: i64) -> Option<PathBuf> {
        if let Some(entry) = self.entries.get(&chat_id) {
            if entry.at.elapsed() < TTL {
                return entry.value.clone();
            }
        }

        let dir = media_root.join("avatars").join("chats");
        let prefix = chat_id.to_string();
        let found = tokio::task::spawn_blocking(move || scan_latest(&dir, &prefix))
            .await
            .ok()
            .flatten();

        self.entries.insert(
            chat_id,
            CacheEntry {
                value: found.clone(),
                at: Instant::now(),
            },
        );
        found
    }
}

fn scan_latest(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let read_dir = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;
    for entry in read_dir.flatten() {
        let path = entry.path();
        let stem = path.file_stem().and_then(|s| s.to_str());
        if stem != Some(prefix) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if best.as_ref().map(|(_, t)| modified > *t).unwrap_or(true) {
            best = Some((path, modified));
        }
    }
    best.map(|(path, _)| path)
}
