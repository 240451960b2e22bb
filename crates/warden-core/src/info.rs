//! Per-service bookkeeping the container exposes to introspection and tests.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::address::Address;
use crate::error::EngineError;

#[derive(Debug, Default)]
struct InfoState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    errs: Vec<(DateTime<Utc>, String)>,
    address: Option<Address>,
}

/// Mutable service metadata, guarded by a single `RwLock` since every write
/// here is a plain field assignment -- never held across an `.await`.
#[derive(Debug)]
pub struct ServiceInfo {
    name: String,
    slug: String,
    loader_timeout: Duration,
    state: RwLock<InfoState>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, slug: impl Into<String>, loader_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            loader_timeout,
            state: RwLock::new(InfoState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn loader_timeout(&self) -> Duration {
        self.loader_timeout
    }

    pub fn address(&self) -> Option<Address> {
        self.state.read().expect("info lock poisoned").address.clone()
    }

    pub fn set_address(&self, address: Address) {
        self.state.write().expect("info lock poisoned").address = Some(address);
    }

    pub fn mark_started(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().expect("info lock poisoned");
        state.running = true;
        state.started_at = Some(at);
        state.stopped_at = None;
    }

    pub fn mark_stopped(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().expect("info lock poisoned");
        state.running = false;
        state.stopped_at = Some(at);
    }

    pub fn add_error(&self, at: DateTime<Utc>, err: &EngineError) {
        let mut state = self.state.write().expect("info lock poisoned");
        state.errs.push((at, err.message()));
    }

    pub fn running(&self) -> bool {
        self.state.read().expect("info lock poisoned").running
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("info lock poisoned").started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("info lock poisoned").stopped_at
    }

    pub fn errs(&self) -> Vec<(DateTime<Utc>, String)> {
        self.state.read().expect("info lock poisoned").errs.clone()
    }

    /// A service's info is valid once it has a name and a resolved address --
    /// the latter is only set once the container has been registered with
    /// the engine, so a freshly-built, not-yet-registered `ServiceInfo` is
    /// deliberately invalid.
    pub fn valid(&self) -> bool {
        !self.name.is_empty() && self.address().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let info = ServiceInfo::new("lidar", "lidar", Duration::from_secs(30));
        assert!(!info.valid(), "not valid until an address is resolved");
        info.set_address(Address::new("warden", "demo", "primary", "lidar"));
        assert!(info.valid());
        assert!(!info.running());

        let t0 = Utc::now();
        info.mark_started(t0);
        assert!(info.running());
        assert_eq!(info.started_at(), Some(t0));

        info.add_error(t0, &EngineError::ServiceTerminated);
        assert_eq!(info.errs().len(), 1);

        let t1 = Utc::now();
        info.mark_stopped(t1);
        assert!(!info.running());
        assert_eq!(info.stopped_at(), Some(t1));
    }

    #[test]
    fn invalid_without_name_or_address() {
        let info = ServiceInfo::new("", "slug", Duration::from_secs(1));
        assert!(!info.valid());

        let named = ServiceInfo::new("lidar", "lidar", Duration::from_secs(1));
        assert!(!named.valid(), "no address resolved yet");
    }
}
