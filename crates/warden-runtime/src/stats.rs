//! Periodic process-level statistics sampling. The snapshot shape is
//! runtime-agnostic ([`warden_core::StatsSnapshot`]); this module owns the
//! `sysinfo` sampling and the task-count high-water marks, and is driven by
//! the engine's own stats service (see `engine.rs`) rather than a
//! free-standing loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use humansize::{format_size, BINARY};
use sysinfo::{Pid, System};
use warden_core::StatsSnapshot;

/// IEC-humanized byte count, e.g. `"1 MiB"`.
pub fn humanize(bytes: u64) -> String {
    format_size(bytes, BINARY)
}

/// Samples this process's own memory/CPU usage and keeps the latest reading
/// available for introspection, mirroring a health monitor's "last known
/// state" cache rather than pushing samples anywhere.
pub struct StatsProfiler {
    system: RwLock<System>,
    pid: Pid,
    last: RwLock<Option<StatsSnapshot>>,
    task_count_min: AtomicUsize,
    task_count_max: AtomicUsize,
}

impl StatsProfiler {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        Self {
            system: RwLock::new(System::new()),
            pid,
            last: RwLock::new(None),
            task_count_min: AtomicUsize::new(usize::MAX),
            task_count_max: AtomicUsize::new(0),
        }
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        self.last.read().expect("stats lock poisoned").clone()
    }

    /// Takes one reading, folding `task_count` into the running high-water
    /// marks, and stores it as the latest snapshot.
    pub fn sample(&self, task_count: usize) -> StatsSnapshot {
        self.task_count_min.fetch_min(task_count, Ordering::SeqCst);
        self.task_count_max.fetch_max(task_count, Ordering::SeqCst);
        let task_count_min = self.task_count_min.load(Ordering::SeqCst);
        let task_count_max = self.task_count_max.load(Ordering::SeqCst);

        let mut system = self.system.write().expect("stats lock poisoned");
        system.refresh_process(self.pid);
        let (resident_bytes, virtual_bytes, cpu_usage_percent) = match system.process(self.pid) {
            Some(process) => (process.memory(), process.virtual_memory(), process.cpu_usage()),
            None => (0, 0, 0.0),
        };

        let snapshot = StatsSnapshot {
            sampled_at: Utc::now(),
            resident_bytes,
            virtual_bytes,
            cpu_usage_percent,
            task_count,
            task_count_min,
            task_count_max,
        };
        *self.last.write().expect("stats lock poisoned") = Some(snapshot.clone());
        snapshot
    }
}

impl Default for StatsProfiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_captures_own_process_and_tracks_high_water_marks() {
        let profiler = StatsProfiler::new();
        profiler.sample(3);
        profiler.sample(1);
        let snapshot = profiler.sample(5);
        assert_eq!(snapshot.task_count, 5);
        assert_eq!(snapshot.task_count_min, 1);
        assert_eq!(snapshot.task_count_max, 5);
        assert!(profiler.latest().is_some());
    }

    #[test]
    fn humanizes_byte_counts() {
        assert_eq!(humanize(1024 * 1024), "1 MiB");
    }
}
