//! The handle hook bodies receive, abstracted behind a trait so `warden-core`
//! never has to depend on the async runtime that implements it.

use chrono::{DateTime, Utc};

use crate::address::{Address, AddressError};
use crate::error::EngineError;
use crate::event::Event;
use crate::stats::StatsSnapshot;

/// Everything a register/start/stop/tick/tock/listener hook is allowed to do
/// to the engine that is running it.
///
/// Implemented once, by `warden_runtime::engine::Session`; kept as a trait
/// here so hook closures in [`crate::definition::ServiceDefinition`] can be
/// built and unit-tested in `warden-core` without linking against tokio.
pub trait Session: Send + Sync {
    /// The engine's notion of "now" -- a real clock in production, a fixed
    /// instant in tests that exercise retry backoff deterministically.
    fn now(&self) -> DateTime<Utc>;

    /// Publish an event to every container subscribed to its subscription key.
    fn dispatch(&self, event: Event);

    /// Resolve a bare slug to a fully-qualified address in this session's namespace.
    fn resolve(&self, slug: &str) -> Result<Address, AddressError>;

    /// Tear the whole engine down. `err` is `None` for a clean shutdown
    /// request, `Some` when a service's failure escalated past its retry
    /// policy into a fatal engine error.
    fn destroy(&self, err: Option<EngineError>);

    /// Whether the engine is still in a state where a failed service may
    /// be retried at all (`false` once the engine is stopping/stopped).
    fn can_recover(&self) -> bool;

    /// The statistics profiler's most recent reading, if the profiler is
    /// enabled and has sampled at least once. Default `None` so a test
    /// stub that never wires up a profiler doesn't have to override this.
    fn stats(&self) -> Option<StatsSnapshot> {
        None
    }
}
