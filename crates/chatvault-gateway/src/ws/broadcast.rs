use dashmap::DashSet;

use chatvault_core::types::ConnId;

/// Tracks currently-open WebSocket connections. Per-connection delivery
/// filtering (scope, subscriptions) lives entirely in the connection task
/// itself — this registry only exists so `/health` and logging can report
/// how many clients are attached.
#[derive(Default)]
pub struct ConnRegistry {
    conns: DashSet<ConnId>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnId) {
        self.conns.insert(id);
    }

    pub fn remove(&self, id: &ConnId) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}
