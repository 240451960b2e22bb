//! Resolves a bundle of service names up front, asks the engine to start
//! them via a `services.start.services` event, and polls their
//! [`ServiceInfo`] until every one reports running or the bundle times out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;
use warden_core::{bundle_payload, Address, Event, EventValue};

use crate::engine::Engine;
use warden_core::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One load attempt over a fixed set of service names. Names are resolved to
/// addresses at construction, so a malformed name surfaces immediately
/// rather than mid-poll; `load` itself is idempotent, returning the first
/// attempt's outcome on any later call.
pub struct Loader {
    targets: HashMap<String, Address>,
    resolve_errors: Vec<String>,
    loaded: AtomicBool,
    last_err: Mutex<Option<String>>,
}

impl Loader {
    pub fn new(engine: &Engine, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut targets = HashMap::new();
        let mut resolve_errors = Vec::new();
        for name in names {
            let name = name.into();
            match engine.resolve(&name) {
                Ok(addr) => {
                    targets.insert(name, addr);
                }
                Err(e) => resolve_errors.push(format!("{name}: {e}")),
            }
        }
        Self {
            targets,
            resolve_errors,
            loaded: AtomicBool::new(false),
            last_err: Mutex::new(None),
        }
    }

    /// The last `load` outcome's message, if it failed. `None` before the
    /// first call and after a call that succeeded.
    pub fn err(&self) -> Option<String> {
        self.last_err.lock().expect("loader lock poisoned").clone()
    }

    pub async fn load(&self, engine: &Engine, timeout: Duration) -> Result<(), EngineError> {
        if self.loaded.load(Ordering::SeqCst) {
            return match self.err() {
                Some(message) => Err(EngineError::LoaderTimeout(message)),
                None => Ok(()),
            };
        }

        if !self.resolve_errors.is_empty() {
            let message = self.resolve_errors.join("; ");
            self.finish(Some(message.clone()));
            return Err(EngineError::InvalidDefinition(message));
        }

        let paths: Vec<String> = self.targets.values().map(Address::path).collect();
        let payload = bundle_payload(paths.iter().map(String::as_str));
        engine.dispatch(
            Event::new("services", "start.services", EventValue::from("bundle")).with_payload(payload),
        );

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if self.pending(engine, &paths).is_empty() {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.finish(None);
                Ok(())
            }
            Err(_) => {
                let pending = self.pending(engine, &paths).join(", ");
                warn!(pending = pending.as_str(), "loader timed out waiting for services");
                self.finish(Some(pending.clone()));
                Err(EngineError::LoaderTimeout(pending))
            }
        }
    }

    fn pending(&self, engine: &Engine, paths: &[String]) -> Vec<String> {
        paths
            .iter()
            .filter(|path| !engine.info(path).map(|info| info.running()).unwrap_or(false))
            .cloned()
            .collect()
    }

    fn finish(&self, err: Option<String>) {
        *self.last_err.lock().expect("loader lock poisoned") = err;
        self.loaded.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::config::{AppConfig, EngineSection, ServicesSection, StatsSection};
    use warden_core::{EngineConfig, ServiceDefinition};

    fn test_config() -> EngineConfig {
        EngineConfig {
            version: "1".into(),
            app: AppConfig {
                name: "demo".into(),
                address: "warden://demo/primary/app".into(),
                engine: EngineSection::default(),
                stats: StatsSection::default(),
                services: ServicesSection::default(),
            },
        }
    }

    #[tokio::test]
    async fn loads_a_bundle_of_healthy_services() {
        let engine = Engine::new(test_config()).unwrap();
        engine
            .register(ServiceDefinition::builder("lidar", "lidar").on_start(|_| Ok(())).build())
            .await
            .unwrap();
        engine.start().await.unwrap();

        let loader = Loader::new(&engine, ["lidar"]);
        let result = loader.load(&engine, Duration::from_millis(500)).await;
        assert!(result.is_ok());
        assert!(loader.err().is_none());

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn second_load_call_is_idempotent() {
        let engine = Engine::new(test_config()).unwrap();
        engine
            .register(ServiceDefinition::builder("lidar", "lidar").on_start(|_| Ok(())).build())
            .await
            .unwrap();
        engine.start().await.unwrap();

        let loader = Loader::new(&engine, ["lidar"]);
        loader.load(&engine, Duration::from_millis(500)).await.unwrap();
        let second = loader.load(&engine, Duration::from_millis(500)).await;
        assert!(second.is_ok());

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn times_out_when_a_service_never_reaches_running() {
        let engine = Engine::new(test_config()).unwrap();
        engine
            .register(
                ServiceDefinition::builder("lidar", "lidar")
                    .on_start(|_| Err(EngineError::ServiceTerminated))
                    .retry_on_error(false)
                    .build(),
            )
            .await
            .unwrap();
        engine.start().await.unwrap();

        let loader = Loader::new(&engine, ["lidar"]);
        let result = loader.load(&engine, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(EngineError::LoaderTimeout(_))));
        assert!(loader.err().is_some());

        engine.shutdown(Duration::from_secs(1)).await;
    }
}
