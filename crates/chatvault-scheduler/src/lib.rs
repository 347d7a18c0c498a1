//! Daily statistics recomputation at a configured local hour and timezone.

pub mod engine;
pub mod schedule;

pub use engine::StatsScheduler;
