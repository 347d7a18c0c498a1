use chatvault_protocol::ChangeEventData;
use chrono::{DateTime, Utc};

/// A mutation waiting out the buffer delay before being applied and forwarded.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub chat_id: i64,
    pub data: ChangeEventData,
    pub timestamp: DateTime<Utc>,
}

/// An active block arming on a chat, recorded the instant a burst is detected.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub until: DateTime<Utc>,
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    Blocked,
}

#[derive(Debug, Clone, Default)]
pub struct MassOpStats {
    pub applied: u64,
    pub discarded: u64,
    pub bursts_detected: u64,
    pub protected_chats: usize,
    pub currently_blocked: usize,
    pub pending: usize,
}
