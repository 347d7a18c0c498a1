//! Buffers and protects against destructive mutation bursts (mass edits or
//! deletes) on a per-chat basis before they reach subscribers.

pub mod protector;
pub mod types;

pub use protector::MassOperationProtector;
pub use types::{BlockRecord, MassOpStats, PendingOperation, QueueOutcome};
