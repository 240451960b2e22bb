//! `ServiceDefinition`: the declarative description of one service, built
//! once at startup and handed to the engine's loader.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::event::Event;
use crate::session::Session;

pub type RegisterHook = Box<dyn Fn(&dyn Session) -> Result<(), EngineError> + Send + Sync>;
pub type StartHook = Box<dyn Fn(&dyn Session) -> Result<(), EngineError> + Send + Sync>;
pub type StopHook =
    Box<dyn Fn(&dyn Session, Option<&EngineError>) -> Result<(), EngineError> + Send + Sync>;
pub type TickHook =
    Box<dyn Fn(&dyn Session, DateTime<Utc>, Duration) -> Result<(), EngineError> + Send + Sync>;
pub type TockHook =
    Box<dyn Fn(&dyn Session, Duration, f64) -> Result<(), EngineError> + Send + Sync>;
pub type ListenerHook = Box<dyn Fn(&dyn Session, &Event) -> Result<(), EngineError> + Send + Sync>;
pub type CronAction = Arc<dyn Fn(&dyn Session) -> Result<(), EngineError> + Send + Sync>;

/// One `schedule -> action` binding contributed by a service's cron setup hook.
#[derive(Clone)]
pub struct CronJob {
    pub schedule: String,
    pub action: CronAction,
}

pub type CronSetupHook = Box<dyn Fn() -> Vec<CronJob> + Send + Sync>;

/// Subscription key a listener hook is registered under: either a concrete
/// `scope.key`, or the wildcard that matches every dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenKey {
    Key(String),
    Any,
}

/// Retry, timeout and throttling knobs scoped to a single service.
///
/// Falls back to the engine-wide defaults in [`crate::config::EngineConfig`]
/// whenever a field is left at its `Default`, mirroring how the teacher's
/// `PolicyConfig` layers a service-level override on top of a global one.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub retry_on_error: bool,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub loader_timeout: Duration,
    pub throttle_ticks: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            retry_on_error: true,
            max_retries: 4,
            retry_backoff: Duration::from_millis(10),
            loader_timeout: Duration::from_secs(30),
            throttle_ticks: Duration::ZERO,
        }
    }
}

/// The declarative description of one service: its identity, its lifecycle
/// hooks, its event subscriptions and its cron contributions.
///
/// Built exclusively through [`ServiceDefinitionBuilder`]; construction
/// errors (missing name, duplicate listener key, ...) accumulate in
/// `build_errors` rather than panicking, so a bad definition surfaces as a
/// normal registration failure instead of aborting the process that builds it.
pub struct ServiceDefinition {
    pub name: String,
    pub slug: String,
    pub register: Option<RegisterHook>,
    pub start: Option<StartHook>,
    pub stop: Option<StopHook>,
    pub tick: Option<TickHook>,
    pub tock: Option<TockHook>,
    pub listeners: Vec<(ListenKey, ListenerHook)>,
    pub cron_setup: Option<CronSetupHook>,
    pub options: ServiceOptions,
    pub build_errors: Vec<String>,
}

impl ServiceDefinition {
    pub fn builder(name: impl Into<String>, slug: impl Into<String>) -> ServiceDefinitionBuilder {
        ServiceDefinitionBuilder::new(name, slug)
    }

    pub fn is_valid(&self) -> bool {
        self.build_errors.is_empty() && !self.name.is_empty() && !self.slug.is_empty()
    }
}

#[derive(Default)]
pub struct ServiceDefinitionBuilder {
    name: String,
    slug: String,
    register: Option<RegisterHook>,
    start: Option<StartHook>,
    stop: Option<StopHook>,
    tick: Option<TickHook>,
    tock: Option<TockHook>,
    listeners: Vec<(ListenKey, ListenerHook)>,
    cron_setup: Option<CronSetupHook>,
    options: ServiceOptions,
    build_errors: Vec<String>,
}

impl ServiceDefinitionBuilder {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        let mut builder = Self {
            name: name.into(),
            slug: slug.into(),
            ..Default::default()
        };
        if builder.name.is_empty() {
            builder.build_errors.push("service name must not be empty".into());
        }
        if builder.slug.is_empty() {
            builder.build_errors.push("service slug must not be empty".into());
        }
        builder
    }

    pub fn on_register(mut self, hook: impl Fn(&dyn Session) -> Result<(), EngineError> + Send + Sync + 'static) -> Self {
        self.register = Some(Box::new(hook));
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&dyn Session) -> Result<(), EngineError> + Send + Sync + 'static) -> Self {
        self.start = Some(Box::new(hook));
        self
    }

    pub fn on_stop(
        mut self,
        hook: impl Fn(&dyn Session, Option<&EngineError>) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.stop = Some(Box::new(hook));
        self
    }

    pub fn on_tick(
        mut self,
        hook: impl Fn(&dyn Session, DateTime<Utc>, Duration) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.tick = Some(Box::new(hook));
        self
    }

    pub fn on_tock(
        mut self,
        hook: impl Fn(&dyn Session, Duration, f64) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.tock = Some(Box::new(hook));
        self
    }

    pub fn on_event(
        mut self,
        key: impl Into<String>,
        hook: impl Fn(&dyn Session, &Event) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((ListenKey::Key(key.into()), Box::new(hook)));
        self
    }

    pub fn on_any_event(
        mut self,
        hook: impl Fn(&dyn Session, &Event) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push((ListenKey::Any, Box::new(hook)));
        self
    }

    pub fn cron(mut self, hook: impl Fn() -> Vec<CronJob> + Send + Sync + 'static) -> Self {
        self.cron_setup = Some(Box::new(hook));
        self
    }

    pub fn retry_on_error(mut self, retry: bool) -> Self {
        self.options.retry_on_error = retry;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.options.max_retries = n;
        self
    }

    pub fn retry_backoff(mut self, d: Duration) -> Self {
        self.options.retry_backoff = d;
        self
    }

    pub fn loader_timeout(mut self, d: Duration) -> Self {
        self.options.loader_timeout = d;
        self
    }

    pub fn throttle_ticks(mut self, d: Duration) -> Self {
        self.options.throttle_ticks = d;
        self
    }

    pub fn build(mut self) -> ServiceDefinition {
        let mut seen_keys = std::collections::HashSet::new();
        for (key, _) in &self.listeners {
            if let ListenKey::Key(k) = key {
                if !seen_keys.insert(k.clone()) {
                    self.build_errors
                        .push(format!("duplicate listener registered for key {k:?}"));
                }
            }
        }
        if self.tock.is_some() && self.tick.is_none() {
            self.build_errors
                .push("tock callback supplied without a tick callback".into());
        }
        ServiceDefinition {
            name: self.name,
            slug: self.slug,
            register: self.register,
            start: self.start,
            stop: self.stop,
            tick: self.tick,
            tock: self.tock,
            listeners: self.listeners,
            cron_setup: self.cron_setup,
            options: self.options,
            build_errors: self.build_errors,
        }
    }
}
