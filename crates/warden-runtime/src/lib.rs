//! The tokio-backed runtime that drives `warden-core` service definitions:
//! the container exclusion wrapper, the engine's start/tick/dispatch/shutdown
//! loop, the cron sub-scheduler, the service loader and the stats profiler.

pub mod container;
pub mod cron;
pub mod engine;
pub mod loader;
pub mod shutdown;
pub mod stats;

pub use container::Container;
pub use cron::{CronError, CronScheduler};
pub use engine::{Engine, EngineState, RuntimeSession};
pub use loader::Loader;
pub use shutdown::{ShutdownCounter, ShutdownGuard};
pub use stats::StatsProfiler;
pub use warden_core::StatsSnapshot;
