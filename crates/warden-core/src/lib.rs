//! Shared types for the service-supervisor engine: addresses, events,
//! service definitions and the configuration they're loaded from.
//!
//! This crate is intentionally runtime-agnostic -- `warden-runtime` owns the
//! tokio event loop, the container and the cron scheduler that actually run
//! a [`definition::ServiceDefinition`].

pub mod address;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod info;
pub mod session;
pub mod stats;

pub use address::{Address, AddressError, AddressResolver, HostResolver};
pub use config::{AppConfig, EngineConfig, EngineSection, ServicesSection, StatsSection, ConfigError};
pub use definition::{
    CronAction, CronJob, CronSetupHook, ListenKey, ListenerHook, RegisterHook, ServiceDefinition,
    ServiceDefinitionBuilder, ServiceOptions, StartHook, StopHook, TickHook, TockHook,
};
pub use error::{BoxError, EngineError, ErrorRecord};
pub use event::{bundle_payload, Event, EventFactory, EventValue, Payload};
pub use info::ServiceInfo;
pub use session::Session;
pub use stats::StatsSnapshot;
