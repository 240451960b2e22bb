//! The runtime-agnostic shape the statistics profiler publishes. Sampling
//! itself (via `sysinfo`) lives in `warden-runtime`; this crate only needs
//! the data shape so [`crate::session::Session`] can expose it without
//! depending on the sampler.

use chrono::{DateTime, Utc};

/// A single reading of the engine's own process/task health.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_usage_percent: f32,
    pub task_count: usize,
    /// Smallest/largest `task_count` ever observed, since no runtime exposes
    /// a stable task census to derive these after the fact.
    pub task_count_min: usize,
    pub task_count_max: usize,
}
