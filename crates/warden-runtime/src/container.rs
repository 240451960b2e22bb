//! The exclusive wrapper around one [`ServiceDefinition`] that the engine
//! drives through register/start/stop/tick/tock/handle_event.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use warden_core::{Address, EngineError, Event, EventValue, Payload, ServiceDefinition, ServiceInfo, Session};

/// How long a container will wait to acquire its exclusive op lock before it
/// gives up and force-shuts-down rather than risk deadlocking the engine.
const LOCK_WAIT: Duration = Duration::from_secs(1);

/// Ceiling on the whole retry-with-backoff escalation, independent of how
/// many individual attempts `max_retries` allows.
const ESCALATION_DEADLINE: Duration = Duration::from_secs(30);

/// One running (or not-yet-started, or quarantined) service.
///
/// All of `start`/`stop`/`tick`/`tock`/`handle_event`/`register`/`cancel`/
/// `force_shutdown` serialize on `op_lock`: the container never runs two of
/// these concurrently against the same service, matching the definition's
/// assumption that its hooks are never called re-entrantly.
pub struct Container {
    definition: ServiceDefinition,
    info: Arc<ServiceInfo>,
    op_lock: Mutex<()>,
    attempt: AtomicU32,
    quarantined: std::sync::atomic::AtomicBool,
    /// Name of the operation currently (or most recently) holding `op_lock`,
    /// a breadcrumb for diagnosing a container stuck mid-escalation.
    lock_info: std::sync::RwLock<&'static str>,
    /// This service's own slice of the engine's cancellation tree. Replaced
    /// with a fresh child of the engine's token every `start`, so a prior
    /// run's cancellation never leaks into the next one.
    cancel: std::sync::RwLock<CancellationToken>,
    /// Set once `force_shutdown` has run; a tick loop still mid-iteration
    /// treats the definition's callbacks as erased without needing to touch
    /// the definition itself.
    disabled: AtomicBool,
}

impl Container {
    pub fn new(definition: ServiceDefinition, loader_timeout: Duration) -> Self {
        let info = Arc::new(ServiceInfo::new(
            definition.name.clone(),
            definition.slug.clone(),
            loader_timeout,
        ));
        Self {
            definition,
            info,
            op_lock: Mutex::new(()),
            attempt: AtomicU32::new(0),
            quarantined: std::sync::atomic::AtomicBool::new(false),
            lock_info: std::sync::RwLock::new("idle"),
            cancel: std::sync::RwLock::new(CancellationToken::new()),
            disabled: AtomicBool::new(false),
        }
    }

    /// Non-blocking probe: `true` if some operation currently holds the
    /// exclusive lock. Distinct from the retry-acquire loop in `exclusive` --
    /// this never waits, so it's safe to call from a diagnostics path.
    pub fn is_locked(&self) -> bool {
        self.op_lock.try_lock().is_err()
    }

    /// The operation name last passed to `exclusive`, for diagnosing a
    /// container that `is_locked()` reports stuck.
    pub fn lock_info(&self) -> &'static str {
        *self.lock_info.read().expect("lock_info lock poisoned")
    }

    pub fn info(&self) -> &Arc<ServiceInfo> {
        &self.info
    }

    pub fn slug(&self) -> &str {
        &self.definition.slug
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }

    pub fn set_address(&self, address: Address) {
        self.info.set_address(address);
    }

    /// Merges request-scoped query parameters onto the address Info reports,
    /// e.g. extra query data carried by a dispatched `service_start` request.
    /// No-op until the container has a resolved address to merge onto.
    pub fn merge_query(&self, query: &[(String, String)]) {
        if query.is_empty() {
            return;
        }
        if let Some(mut address) = self.info.address() {
            for (key, value) in query {
                address = address.with_query(key.clone(), value.clone());
            }
            self.info.set_address(address);
        }
    }

    pub fn options(&self) -> &warden_core::ServiceOptions {
        &self.definition.options
    }

    /// `true` once `force_shutdown` has run; callers should treat `tick`
    /// and `tock` as erased from that point on.
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn has_tick(&self) -> bool {
        self.definition.tick.is_some() && !self.disabled()
    }

    /// This service's own cancellation token, a child of the engine-wide
    /// token handed to `start`. Cancelling it (via `stop` or `force_shutdown`)
    /// never affects any other container.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().expect("cancel lock poisoned").clone()
    }

    /// Runs the definition's cron setup hook, if any, and hands back the
    /// jobs it contributed. Only meaningful to call once, at registration.
    pub fn cron_jobs(&self) -> Vec<warden_core::CronJob> {
        self.definition
            .cron_setup
            .as_ref()
            .map(|setup| setup())
            .unwrap_or_default()
    }

    pub async fn register(&self, session: &dyn Session) -> Result<(), EngineError> {
        self.exclusive("register", || {
            if let Some(hook) = &self.definition.register {
                hook(session)
            } else {
                Ok(())
            }
        })
        .await
    }

    /// Starts the service and always publishes `service.started`, whether or
    /// not the user's own start hook succeeded -- the event reflects the
    /// attempt, and its payload's `err` field reflects the outcome.
    pub async fn start(&self, session: &dyn Session, engine_cancel: &CancellationToken) -> Result<(), EngineError> {
        *self.cancel.write().expect("cancel lock poisoned") = engine_cancel.child_token();

        let result = self
            .exclusive("start", || {
                if let Some(hook) = &self.definition.start {
                    hook(session)
                } else {
                    Ok(())
                }
            })
            .await;

        if result.is_ok() {
            self.info.mark_started(session.now());
            self.attempt.store(0, Ordering::SeqCst);
        }
        self.publish_started(session, result.as_ref().err());
        result
    }

    fn publish_started(&self, session: &dyn Session, err: Option<&EngineError>) {
        let addr = self.info.address().map(|a| a.to_string()).unwrap_or_default();
        let mut payload = Payload::new();
        payload.insert("addr".into(), EventValue::Str(addr));
        payload.insert("running".into(), EventValue::Bool(self.info.running()));
        if let Some(started_at) = self.info.started_at() {
            payload.insert("started.at".into(), EventValue::Str(started_at.to_rfc3339()));
        }
        if let Some(err) = err {
            payload.insert("err".into(), EventValue::Str(err.to_string()));
        }
        session.dispatch(Event::new("service", "started", EventValue::Str(self.name().to_string())).with_payload(payload));
    }

    /// Idempotent: a service that is already stopped publishes a bare
    /// `service.stopped` and returns `Ok(())` without re-invoking the user's
    /// stop hook or re-cancelling an already-cancelled context.
    pub async fn stop(&self, session: &dyn Session, err: Option<&EngineError>) -> Result<(), EngineError> {
        if !self.info.running() {
            session.dispatch(Event::new("service", "stopped", EventValue::Str(self.name().to_string())));
            return Ok(());
        }

        self.cancel_token().cancel();

        let result = self
            .exclusive("stop", || {
                if let Some(hook) = &self.definition.stop {
                    hook(session, err)
                } else {
                    Ok(())
                }
            })
            .await;
        self.info.mark_stopped(session.now());
        self.publish_stopped(session, result.as_ref().err().or(err));
        result
    }

    fn publish_stopped(&self, session: &dyn Session, err: Option<&EngineError>) {
        let addr = self.info.address().map(|a| a.to_string()).unwrap_or_default();
        let mut payload = Payload::new();
        payload.insert("name".into(), EventValue::Str(self.name().to_string()));
        payload.insert("addr".into(), EventValue::Str(addr));
        payload.insert("running".into(), EventValue::Bool(false));
        if let Some(stopped_at) = self.info.stopped_at() {
            payload.insert("stopped.at".into(), EventValue::Str(stopped_at.to_rfc3339()));
        }
        if let Some(err) = err {
            payload.insert("err".into(), EventValue::Str(err.to_string()));
        }
        session.dispatch(Event::new("service", "stopped", EventValue::Str(self.name().to_string())).with_payload(payload));
    }

    pub async fn tick(&self, session: &dyn Session, elapsed: Duration) -> Result<(), EngineError> {
        if self.disabled() {
            return Ok(());
        }
        self.exclusive("tick", || {
            if let Some(hook) = &self.definition.tick {
                hook(session, session.now(), elapsed)
            } else {
                Ok(())
            }
        })
        .await
    }

    pub async fn tock(&self, session: &dyn Session, elapsed: Duration, load: f64) -> Result<(), EngineError> {
        if self.disabled() {
            return Ok(());
        }
        self.exclusive("tock", || {
            if let Some(hook) = &self.definition.tock {
                hook(session, elapsed, load)
            } else {
                Ok(())
            }
        })
        .await
    }

    pub async fn handle_event(&self, session: &dyn Session, event: &Event) -> Result<(), EngineError> {
        let key = event.subscription_key();
        self.exclusive("handle_event", || {
            let mut last = Ok(());
            for (listen_key, hook) in &self.definition.listeners {
                let matches = match listen_key {
                    warden_core::ListenKey::Key(k) => *k == key,
                    warden_core::ListenKey::Any => true,
                };
                if matches {
                    last = hook(session, event);
                    if last.is_err() {
                        break;
                    }
                }
            }
            last
        })
        .await
    }

    /// Runs one retry attempt's worth of backoff bookkeeping. Returns `true`
    /// if the caller should retry, `false` if the error was fatal or the
    /// retry budget is exhausted, quarantining the container either way.
    pub async fn should_retry(&self, err: &EngineError) -> bool {
        if err.is_terminal() || !self.options().retry_on_error {
            self.quarantined.store(true, Ordering::SeqCst);
            return false;
        }
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.options().max_retries {
            warn!(service = self.slug(), attempts = attempt, "retry budget exhausted, quarantining");
            self.quarantined.store(true, Ordering::SeqCst);
            return false;
        }
        let backoff = self.options().retry_backoff * 10u32.saturating_pow(attempt);
        debug!(service = self.slug(), attempt, ?backoff, "backing off before retry");
        tokio::time::sleep(backoff).await;
        true
    }

    /// Escalation path the engine falls back to when a container is still
    /// locked after the quarantine/retry window has run out. Cancels this
    /// service's own context, erases its tick/tock callbacks so no further
    /// loop iteration invokes them, and marks it stopped directly rather than
    /// waiting for the deadlocked hook to release `op_lock` -- the one
    /// legitimate violation of the container's own exclusion invariant.
    pub async fn force_shutdown(&self, session: &dyn Session, err: &EngineError) {
        error!(service = self.slug(), %err, "force-shutting-down service after lock timeout");
        self.disabled.store(true, Ordering::SeqCst);
        self.quarantined.store(true, Ordering::SeqCst);
        self.cancel_token().cancel();
        self.info.mark_stopped(session.now());
        self.info.add_error(session.now(), err);
        self.publish_stopped(session, Some(err));
    }

    async fn exclusive<F>(&self, op: &'static str, f: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Result<(), EngineError>,
    {
        let deadline = Instant::now() + ESCALATION_DEADLINE;
        let guard = loop {
            match tokio::time::timeout(LOCK_WAIT, self.op_lock.lock()).await {
                Ok(guard) => break guard,
                Err(_) if Instant::now() < deadline => {
                    warn!(service = self.slug(), op, "op lock contended, retrying acquisition");
                    continue;
                }
                Err(_) => return Err(EngineError::LockTimeout),
            }
        };
        *self.lock_info.write().expect("lock_info lock poisoned") = op;

        let result = std::panic::catch_unwind(AssertUnwindSafe(f));
        *self.lock_info.write().expect("lock_info lock poisoned") = "idle";
        drop(guard);

        match result {
            Ok(r) => r,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(service = self.slug(), op, %message, "service hook panicked");
                Err(EngineError::Panicked(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use warden_core::ServiceDefinition as Def;

    #[derive(Default)]
    struct NoopSession {
        dispatched: StdMutex<Vec<Event>>,
    }
    impl Session for NoopSession {
        fn now(&self) -> chrono::DateTime<Utc> {
            Utc::now()
        }
        fn dispatch(&self, event: Event) {
            self.dispatched.lock().unwrap().push(event);
        }
        fn resolve(&self, slug: &str) -> Result<Address, warden_core::AddressError> {
            Ok(Address::new("warden", "test", "primary", slug))
        }
        fn destroy(&self, _err: Option<EngineError>) {}
        fn can_recover(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn start_then_stop_marks_info() {
        let def = Def::builder("lidar", "lidar").on_start(|_| Ok(())).build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let engine_cancel = CancellationToken::new();
        container.start(&session, &engine_cancel).await.unwrap();
        assert!(container.info().running());
        container.stop(&session, None).await.unwrap();
        assert!(!container.info().running());
    }

    #[tokio::test]
    async fn start_and_stop_publish_lifecycle_events() {
        let def = Def::builder("lidar", "lidar").on_start(|_| Ok(())).build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let engine_cancel = CancellationToken::new();
        container.start(&session, &engine_cancel).await.unwrap();
        container.stop(&session, None).await.unwrap();

        let dispatched = session.dispatched.lock().unwrap();
        assert_eq!(dispatched[0].subscription_key(), "service.started");
        assert_eq!(dispatched[1].subscription_key(), "service.stopped");
        let started_payload = dispatched[0].payload().unwrap();
        assert_eq!(started_payload.get("running"), Some(&EventValue::Bool(true)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let def = Def::builder("lidar", "lidar").build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let engine_cancel = CancellationToken::new();
        container.start(&session, &engine_cancel).await.unwrap();

        container.stop(&session, None).await.unwrap();
        container.stop(&session, None).await.unwrap();

        let dispatched = session.dispatched.lock().unwrap();
        let stopped_count = dispatched.iter().filter(|e| e.subscription_key() == "service.stopped").count();
        assert_eq!(stopped_count, 2, "second stop should still publish, but must not re-run the hook");
    }

    #[tokio::test]
    async fn terminal_error_quarantines_without_retry() {
        let def = Def::builder("lidar", "lidar").build();
        let container = Container::new(def, Duration::from_secs(5));
        let retry = container.should_retry(&EngineError::ServiceTerminated).await;
        assert!(!retry);
        assert!(container.quarantined());
    }

    #[tokio::test]
    async fn exhausting_retries_quarantines() {
        let def = Def::builder("lidar", "lidar")
            .max_retries(1)
            .retry_backoff(Duration::from_millis(1))
            .build();
        let container = Container::new(def, Duration::from_secs(5));
        assert!(container.should_retry(&EngineError::LockTimeout).await);
        assert!(!container.should_retry(&EngineError::LockTimeout).await);
        assert!(container.quarantined());
    }

    #[tokio::test]
    async fn panicking_hook_is_caught() {
        let def = Def::builder("lidar", "lidar")
            .on_tick(|_, _, _| panic!("boom"))
            .build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let err = container.tick(&session, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, EngineError::Panicked(_)));
    }

    #[tokio::test]
    async fn lock_info_tracks_the_operation_and_resets_when_idle() {
        let def = Def::builder("lidar", "lidar").on_start(|_| Ok(())).build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let engine_cancel = CancellationToken::new();
        assert!(!container.is_locked());
        assert_eq!(container.lock_info(), "idle");

        container.start(&session, &engine_cancel).await.unwrap();
        assert!(!container.is_locked());
        assert_eq!(container.lock_info(), "idle");
    }

    #[tokio::test]
    async fn force_shutdown_marks_stopped_and_disables_ticking() {
        let def = Def::builder("lidar", "lidar")
            .on_start(|_| Ok(()))
            .on_tick(|_, _, _| Ok(()))
            .build();
        let container = Container::new(def, Duration::from_secs(5));
        let session = NoopSession::default();
        let engine_cancel = CancellationToken::new();
        container.start(&session, &engine_cancel).await.unwrap();
        assert!(container.has_tick());

        container.force_shutdown(&session, &EngineError::LockTimeout).await;

        assert!(!container.info().running());
        assert!(container.quarantined());
        assert!(!container.has_tick(), "force_shutdown must erase the tick callback");
        assert!(container.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn merge_query_extends_the_resolved_address() {
        let def = Def::builder("lidar", "lidar").build();
        let container = Container::new(def, Duration::from_secs(5));
        container.set_address(Address::new("warden", "demo", "primary", "lidar"));

        container.merge_query(&[("replay".to_string(), "true".to_string())]);

        let addr = container.info().address().unwrap();
        assert_eq!(addr.query("replay"), Some("true"));
    }
}
