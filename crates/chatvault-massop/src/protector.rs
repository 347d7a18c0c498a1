use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chatvault_protocol::ChangeEventData;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::types::{BlockRecord, MassOpStats, PendingOperation, QueueOutcome};

/// Per-chat pending buffer plus a block record, kept together so queue's
/// burst check and discard are one critical section — no intermediate
/// state is ever observable from outside this lock.
#[derive(Default)]
struct ChatState {
    pending: Vec<PendingOperation>,
    blocked: Option<BlockRecord>,
}

/// Buffers edit/delete mutations for a short window and discards an entire
/// burst atomically when a chat exceeds its mutation threshold, protecting
/// subscribers from a flood of destructive changes (e.g. a bulk delete run
/// against the source account).
pub struct MassOperationProtector {
    chats: Mutex<HashMap<i64, ChatState>>,
    protected_chats: Mutex<HashSet<i64>>,
    threshold: usize,
    window: ChronoDuration,
    buffer_delay: ChronoDuration,
    applied: AtomicU64,
    discarded: AtomicU64,
    bursts_detected: AtomicU64,
}

impl MassOperationProtector {
    pub fn new(threshold: usize, window_seconds: i64, buffer_delay_seconds: f64) -> Self {
        Self {
            chats: Mutex::new(HashMap::new()),
            protected_chats: Mutex::new(HashSet::new()),
            threshold,
            window: ChronoDuration::seconds(window_seconds),
            buffer_delay: ChronoDuration::milliseconds((buffer_delay_seconds * 1000.0) as i64),
            applied: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            bursts_detected: AtomicU64::new(0),
        }
    }

    /// Queue one mutation. Returns `Blocked` both when the chat is already
    /// blocked and when this call itself trips the burst threshold.
    #[instrument(skip(self, data), fields(chat_id))]
    pub fn queue(&self, chat_id: i64, data: ChangeEventData) -> QueueOutcome {
        let now = Utc::now();
        let mut chats = self.chats.lock().unwrap();
        let state = chats.entry(chat_id).or_default();

        if let Some(block) = &state.blocked {
            if block.until > now {
                return QueueOutcome::Blocked;
            }
        }
        state.blocked = None;

        state.pending.push(PendingOperation {
            chat_id,
            data,
            timestamp: now,
        });

        if state.pending.len() >= self.threshold {
            let drop_size = state.pending.len();
            state.pending.clear();
            state.blocked = Some(BlockRecord {
                until: now + self.window,
                reason: "burst threshold exceeded".to_string(),
                count: drop_size,
            });
            drop(chats);

            self.bursts_detected.fetch_add(1, Ordering::Relaxed);
            self.discarded.fetch_add(drop_size as u64, Ordering::Relaxed);
            self.protected_chats.lock().unwrap().insert(chat_id);
            warn!(chat_id, drop_size, "mass-operation burst detected, chat blocked");
            return QueueOutcome::Blocked;
        }

        QueueOutcome::Queued
    }

    /// Remove block records that have aged out. Called lazily by `queue`
    /// via the check above and opportunistically by `release`/`stats`.
    fn expire_blocks(&self, chats: &mut HashMap<i64, ChatState>, now: DateTime<Utc>) {
        for state in chats.values_mut() {
            if let Some(block) = &state.blocked {
                if block.until <= now {
                    state.blocked = None;
                }
            }
        }
    }

    /// Drain every operation older than the buffer delay from chats that
    /// are not currently blocked. Idempotent: a call with nothing ready
    /// returns an empty vec and leaves state untouched.
    #[instrument(skip(self))]
    pub fn release(&self) -> Vec<PendingOperation> {
        let now = Utc::now();
        let cutoff = now - self.buffer_delay;
        let mut chats = self.chats.lock().unwrap();
        self.expire_blocks(&mut chats, now);

        let mut ready = Vec::new();
        for state in chats.values_mut() {
            if state.blocked.is_some() {
                continue;
            }
            let (due, rest): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|op| op.timestamp < cutoff);
            state.pending = rest;
            ready.extend(due);
        }

        if !ready.is_empty() {
            self.applied.fetch_add(ready.len() as u64, Ordering::Relaxed);
        }
        ready
    }

    pub fn stats(&self) -> MassOpStats {
        let now = Utc::now();
        let mut chats = self.chats.lock().unwrap();
        self.expire_blocks(&mut chats, now);
        let currently_blocked = chats.values().filter(|s| s.blocked.is_some()).count();
        let pending = chats.values().map(|s| s.pending.len()).sum();
        MassOpStats {
            applied: self.applied.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            bursts_detected: self.bursts_detected.load(Ordering::Relaxed),
            protected_chats: self.protected_chats.lock().unwrap().len(),
            currently_blocked,
            pending,
        }
    }

    /// Background loop: call `release` at a fixed cadence and forward each
    /// released operation down `tx` for application by the caller. Exits
    /// once `shutdown` broadcasts `true`, after one final drain.
    pub async fn run_release_loop(
        self: std::sync::Arc<Self>,
        tx: mpsc::Sender<PendingOperation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("mass-operation release loop started");
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_and_forward(&tx).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.drain_and_forward(&tx).await;
                        info!("mass-operation release loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn drain_and_forward(&self, tx: &mpsc::Sender<PendingOperation>) {
        for op in self.release() {
            if tx.send(op).await.is_err() {
                warn!("mass-operation release channel closed, dropping remaining ops");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(message_id: i64) -> ChangeEventData {
        ChangeEventData::Edit {
            message_id,
            new_text: "hi".to_string(),
            edit_date: chrono::Utc::now().naive_utc(),
        }
    }

    #[test]
    fn queues_below_threshold() {
        let p = MassOperationProtector::new(10, 30, 2.0);
        assert_eq!(p.queue(1, edit(1)), QueueOutcome::Queued);
        let stats = p.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.bursts_detected, 0);
    }

    #[test]
    fn burst_discards_with_zero_footprint() {
        let p = MassOperationProtector::new(3, 30, 2.0);
        assert_eq!(p.queue(1, edit(1)), QueueOutcome::Queued);
        assert_eq!(p.queue(1, edit(2)), QueueOutcome::Queued);
        assert_eq!(p.queue(1, edit(3)), QueueOutcome::Blocked);

        let stats = p.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.discarded, 3);
        assert_eq!(stats.bursts_detected, 1);
        assert_eq!(stats.protected_chats, 1);
        assert_eq!(stats.currently_blocked, 1);
    }

    #[test]
    fn blocked_chat_rejects_further_queues() {
        let p = MassOperationProtector::new(2, 30, 2.0);
        p.queue(1, edit(1));
        p.queue(1, edit(2));
        assert_eq!(p.queue(1, edit(3)), QueueOutcome::Blocked);
        assert_eq!(p.stats().pending, 0);
    }

    #[test]
    fn other_chats_are_unaffected_by_a_burst() {
        let p = MassOperationProtector::new(2, 30, 2.0);
        p.queue(1, edit(1));
        p.queue(1, edit(2));
        assert_eq!(p.queue(2, edit(1)), QueueOutcome::Queued);
        assert_eq!(p.stats().pending, 1);
    }

    #[test]
    fn release_is_empty_before_buffer_delay_elapses() {
        let p = MassOperationProtector::new(10, 30, 60.0);
        p.queue(1, edit(1));
        assert!(p.release().is_empty());
        assert_eq!(p.stats().pending, 1);
    }

    #[test]
    fn release_returns_due_operations_and_updates_applied() {
        let p = MassOperationProtector::new(10, 30, 0.0);
        p.queue(1, edit(1));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let ops = p.release();
        assert_eq!(ops.len(), 1);
        assert_eq!(p.stats().applied, 1);
        assert_eq!(p.stats().pending, 0);
    }
}
