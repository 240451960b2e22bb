//! The engine: owns every registered container, drives its startup,
//! tick/tock loop, event dispatch and shutdown sequence.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_core::{
    Address, AddressError, AddressResolver, EngineConfig, EngineError, Event, EventValue,
    HostResolver, ListenKey, ServiceDefinition, ServiceInfo, Session, StatsSnapshot,
};

use crate::container::Container;
use crate::cron::CronScheduler;
use crate::shutdown::ShutdownCounter;
use crate::stats::StatsProfiler;

const SERVICES_SCOPE: &str = "services";
const START_SERVICES_KEY: &str = "start.services";
const STOP_SERVICES_KEY: &str = "stop.services";

/// Internal service slug the statistics profiler is registered under when
/// `app.stats.enabled` is set, so its sampling rides the ordinary
/// tick/tock loop instead of a bespoke task.
const STATS_SLUG: &str = "stats";

/// How many of a container's most recent ticks feed the tick-rate estimate
/// handed to its tock hook.
const TPS_WINDOW: usize = 120;

/// Overall budget for draining a quarantined (locked-at-shutdown) container.
const QUARANTINE_DEADLINE: Duration = Duration::from_secs(30);

/// `10ms * 10^attempt` backoff schedule: 10ms, 100ms, 1s, 10s.
const QUARANTINE_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Starting,
    Running,
    Failed,
    Stopping,
    Stopped,
}

struct EngineInner {
    config: EngineConfig,
    resolver: HostResolver,
    /// Keyed by `Address::path()`, matching the registry the teacher's own
    /// daemon indexes containers by rather than by a caller-chosen name.
    containers: std::sync::RwLock<HashMap<String, Arc<Container>>>,
    registration_order: std::sync::RwLock<Vec<String>>,
    subscriptions: std::sync::RwLock<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<Event>,
    state: std::sync::RwLock<EngineState>,
    cancel: CancellationToken,
    task_count: AtomicUsize,
    stats: Option<Arc<StatsProfiler>>,
}

impl EngineInner {
    fn container(&self, path: &str) -> Option<Arc<Container>> {
        self.containers.read().expect("containers lock poisoned").get(path).cloned()
    }
}

/// Implements [`warden_core::Session`] by forwarding to the engine's shared
/// state. Cheap to clone -- every hook invocation gets its own handle rather
/// than sharing one across containers.
#[derive(Clone)]
pub struct RuntimeSession {
    inner: Arc<EngineInner>,
}

impl Session for RuntimeSession {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn dispatch(&self, event: Event) {
        if event.is_degenerate() {
            warn!("dropping event with empty scope or key");
            return;
        }
        if self.inner.event_tx.send(event).is_err() {
            warn!("event dispatched after engine's dispatch loop has shut down");
        }
    }

    fn resolve(&self, slug: &str) -> Result<Address, AddressError> {
        self.inner.resolver.resolve_service(slug)
    }

    fn destroy(&self, err: Option<EngineError>) {
        let mut state = self.inner.state.write().expect("engine state lock poisoned");
        match &err {
            Some(e) => {
                error!(%e, "engine destroyed by a fatal service error");
                *state = EngineState::Failed;
            }
            None => {
                info!("engine destroy requested");
                *state = EngineState::Stopping;
            }
        }
        drop(state);
        self.inner.cancel.cancel();
    }

    fn can_recover(&self) -> bool {
        matches!(
            *self.inner.state.read().expect("engine state lock poisoned"),
            EngineState::Running | EngineState::Starting
        )
    }

    fn stats(&self) -> Option<StatsSnapshot> {
        self.inner.stats.as_ref().and_then(|s| s.latest())
    }
}

/// Starts one container by address path, retrying per its own policy until it
/// succeeds, is quarantined, or the engine stops recovering. Spawns the
/// container's tick loop (or a watcher, if it has no tick callback) on
/// success. `query` carries any extra query parameters this particular start
/// request should merge onto the container's resolved address.
async fn start_one(
    inner: &Arc<EngineInner>,
    path: &str,
    query: &[(String, String)],
    session: &RuntimeSession,
) -> Result<(), EngineError> {
    let Some(container) = inner.container(path) else {
        warn!(path, "service_start for unknown address");
        return Err(EngineError::InvalidDefinition(path.to_string()));
    };
    if container.info().running() || container.quarantined() {
        return Ok(());
    }
    container.merge_query(query);

    loop {
        match container.start(session, &inner.cancel).await {
            Ok(()) => {
                if container.has_tick() {
                    spawn_tick_loop(inner, session.clone(), Arc::clone(&container));
                } else {
                    spawn_watcher(inner, Arc::clone(&container));
                }
                return Ok(());
            }
            Err(e) => {
                warn!(service = path, %e, "service failed to start");
                container.info().add_error(session.now(), &e);
                if !session.can_recover() || !container.should_retry(&e).await {
                    return Err(e);
                }
            }
        }
    }
}

/// Stops one container by address path. `ErrServiceTerminated` (the sentinel
/// a `services.stop.services` event carries) is normalized to `None` so the
/// container's stop hook doesn't treat its own scheduled shutdown as a failure.
async fn stop_one(inner: &Arc<EngineInner>, path: &str, err: Option<EngineError>, session: &RuntimeSession) -> Result<(), EngineError> {
    let Some(container) = inner.container(path) else {
        return Err(EngineError::InvalidDefinition(path.to_string()));
    };
    let normalized = match &err {
        Some(EngineError::ServiceTerminated) => None,
        other => other.as_ref(),
    };
    container.stop(session, normalized).await
}

/// Drains a container that was still locked when `shutdown` began: retries
/// the unlock test up to [`QUARANTINE_MAX_ATTEMPTS`] times with `10ms *
/// 10^attempt` backoff inside [`QUARANTINE_DEADLINE`], taking the normal stop
/// path the moment it unlocks. If it never does, force-shuts it down.
async fn join_quarantined(inner: &Arc<EngineInner>, path: &str, session: &RuntimeSession) {
    let Some(container) = inner.container(path) else {
        return;
    };
    let deadline = Instant::now() + QUARANTINE_DEADLINE;

    for attempt in 0..QUARANTINE_MAX_ATTEMPTS {
        if !container.is_locked() {
            if let Err(e) = stop_one(inner, path, Some(EngineError::LockTimeout), session).await {
                error!(service = path, %e, "quarantined service failed to stop after unlocking");
            }
            return;
        }
        let backoff = Duration::from_millis(10) * 10u32.saturating_pow(attempt);
        if Instant::now() + backoff > deadline {
            break;
        }
        debug!(service = path, attempt, ?backoff, "quarantined service still locked, backing off");
        tokio::time::sleep(backoff).await;
    }

    if container.is_locked() {
        container.force_shutdown(session, &EngineError::LockTimeout).await;
    } else if let Err(e) = stop_one(inner, path, Some(EngineError::LockTimeout), session).await {
        error!(service = path, %e, "quarantined service failed to stop after unlocking");
    }
}

fn spawn_tick_loop(inner: &Arc<EngineInner>, session: RuntimeSession, container: Arc<Container>) {
    if !container.has_tick() {
        return;
    }
    let throttle = container.options().throttle_ticks.max(Duration::from_millis(1));
    let cancel = container.cancel_token();
    inner.task_count.fetch_add(1, Ordering::SeqCst);
    let inner = Arc::clone(inner);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(throttle);
        let mut last_tick = tokio::time::Instant::now();
        let mut window: VecDeque<tokio::time::Instant> = VecDeque::with_capacity(TPS_WINDOW);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                fired_at = ticker.tick() => {
                    let elapsed = fired_at.duration_since(last_tick);
                    last_tick = fired_at;

                    let hook_start = tokio::time::Instant::now();
                    if let Err(e) = container.tick(&session, elapsed).await {
                        container.info().add_error(session.now(), &e);
                        session.dispatch(Event::new("engine", "tick.error", EventValue::from(container.slug())));
                        if !container.should_retry(&e).await {
                            break;
                        }
                        continue;
                    }
                    let tick_duration = hook_start.elapsed();

                    window.push_back(fired_at);
                    while window.len() > TPS_WINDOW {
                        window.pop_front();
                    }
                    let tps = match (window.len() >= 2, window.front()) {
                        (true, Some(&oldest)) => {
                            let span = fired_at.duration_since(oldest).as_secs_f64();
                            if span > 0.0 { (window.len() - 1) as f64 / span } else { 0.0 }
                        }
                        _ => 0.0,
                    };

                    if let Err(e) = container.tock(&session, tick_duration, tps).await {
                        debug!(service = container.slug(), %e, "tock hook returned an error");
                        session.dispatch(Event::new("engine", "tock.error", EventValue::from(container.slug())));
                    }
                }
            }
        }
        inner.task_count.fetch_sub(1, Ordering::SeqCst);
    });
}

/// Long-lived task for a running service that has no tick callback: simply
/// waits for the container's own context to cancel. Keeps the engine's task
/// census meaningful for a tickless service instead of silently omitting it.
fn spawn_watcher(inner: &Arc<EngineInner>, container: Arc<Container>) {
    inner.task_count.fetch_add(1, Ordering::SeqCst);
    let cancel = container.cancel_token();
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        cancel.cancelled().await;
        inner.task_count.fetch_sub(1, Ordering::SeqCst);
    });
}

/// The engine-owned heartbeat task, independent of any single service's tick
/// loop. Ticks at `app.engine.throttle_ticks` until the engine cancels.
fn spawn_master_tick_loop(inner: &Arc<EngineInner>) {
    let throttle = inner.config.app.engine.throttle_ticks.max(Duration::from_millis(1));
    inner.task_count.fetch_add(1, Ordering::SeqCst);
    let cancel = inner.cancel.clone();
    let inner = Arc::clone(inner);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(throttle);
        let mut last_tick = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                fired_at = ticker.tick() => {
                    let elapsed = fired_at.duration_since(last_tick);
                    last_tick = fired_at;
                    debug!(?elapsed, "master tick loop heartbeat");
                }
            }
        }
        inner.task_count.fetch_sub(1, Ordering::SeqCst);
    });
}

/// Owns the whole supervised process: every container, the cron
/// sub-scheduler, the stats profiler and the shutdown sequence.
pub struct Engine {
    inner: Arc<EngineInner>,
    cron: Arc<CronScheduler>,
    shutdown_counter: Arc<ShutdownCounter>,
    event_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let host = config
            .host_address()
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        let resolver = HostResolver::new(host);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let stats = if config.app.stats.enabled {
            Some(Arc::new(StatsProfiler::new()))
        } else {
            None
        };

        let inner = Arc::new(EngineInner {
            config: config.clone(),
            resolver,
            containers: std::sync::RwLock::new(HashMap::new()),
            registration_order: std::sync::RwLock::new(Vec::new()),
            // The bundle control events the loader drives startup/shutdown
            // with are always routable, independent of whether any service
            // happens to have registered a listener on them.
            subscriptions: std::sync::RwLock::new(HashSet::from([
                format!("{SERVICES_SCOPE}.{START_SERVICES_KEY}"),
                format!("{SERVICES_SCOPE}.{STOP_SERVICES_KEY}"),
                "engine.tick.error".to_string(),
                "engine.tock.error".to_string(),
            ])),
            event_tx,
            state: std::sync::RwLock::new(EngineState::Init),
            cancel: CancellationToken::new(),
            task_count: AtomicUsize::new(0),
            stats,
        });

        Ok(Self {
            inner,
            cron: Arc::new(CronScheduler::new(chrono_tz::UTC)),
            shutdown_counter: ShutdownCounter::new(),
            event_rx: tokio::sync::Mutex::new(Some(event_rx)),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.read().expect("engine state lock poisoned")
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Number of long-lived tasks currently tracked: the master tick loop,
    /// one entry per running service's tick loop or watcher, and the cron
    /// scheduler's own task is tracked separately.
    pub fn task_count(&self) -> usize {
        self.inner.task_count.load(Ordering::SeqCst)
    }

    /// Requests a clean shutdown from outside the engine (e.g. a ctrl-c
    /// handler), equivalent to a hook calling `Session::destroy(None)`.
    pub fn request_shutdown(&self) {
        self.session().destroy(None);
    }

    pub fn session(&self) -> RuntimeSession {
        RuntimeSession {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn resolve(&self, slug: &str) -> Result<Address, AddressError> {
        self.inner.resolver.resolve_service(slug)
    }

    pub fn info(&self, path: &str) -> Option<Arc<ServiceInfo>> {
        self.inner.container(path).map(|c| Arc::clone(c.info()))
    }

    pub fn dispatch(&self, event: Event) {
        self.session().dispatch(event)
    }

    /// Inserts `key` into the subscription table. A key already present
    /// returns a non-fatal error rather than panicking -- several services
    /// listening on the same key is expected, not exceptional.
    pub fn register_event(&self, key: impl Into<String>) -> Result<(), EngineError> {
        let key = key.into();
        let mut subs = self.inner.subscriptions.write().expect("subscriptions lock poisoned");
        if !subs.insert(key.clone()) {
            return Err(EngineError::InvalidDefinition(format!(
                "subscription key {key:?} already registered"
            )));
        }
        Ok(())
    }

    pub fn is_registered_event(&self, key: &str) -> bool {
        self.inner.subscriptions.read().expect("subscriptions lock poisoned").contains(key)
    }

    /// Builds a container from `definition`, runs its register hook and its
    /// cron setup hook, and adds it to the engine. Does not start it --
    /// [`Engine::start`] starts every registered container together.
    pub async fn register(&self, definition: ServiceDefinition) -> Result<(), EngineError> {
        if !definition.is_valid() {
            return Err(EngineError::InvalidDefinition(definition.build_errors.join("; ")));
        }
        let slug = definition.slug.clone();
        let loader_timeout = definition.options.loader_timeout;
        let address = self
            .inner
            .resolver
            .resolve_service(&slug)
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        let path = address.path();

        if self.inner.container(&path).is_some() {
            return Err(EngineError::InvalidDefinition(format!(
                "address {path:?} is already registered"
            )));
        }

        for (listen_key, _) in &definition.listeners {
            if let ListenKey::Key(k) = listen_key {
                // Several services may listen on the same key; that's fine.
                let _ = self.register_event(k.clone());
            }
        }

        let container = Arc::new(Container::new(definition, loader_timeout));
        container.set_address(address);

        let session = self.session();
        container.register(&session).await?;

        for job in container.cron_jobs() {
            self.cron
                .add(slug.clone(), job)
                .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        }

        self.inner
            .containers
            .write()
            .expect("containers lock poisoned")
            .insert(path.clone(), container);
        self.inner
            .registration_order
            .write()
            .expect("registration order lock poisoned")
            .push(path);
        Ok(())
    }

    /// Registers the statistics profiler as an ordinary service, its `tock`
    /// sampling the engine's own task count, so it rides the same tick
    /// cadence and retry/quarantine machinery as any other service. No-op if
    /// stats are disabled in configuration.
    async fn register_stats_service(&self) -> Result<(), EngineError> {
        let Some(stats) = self.inner.stats.clone() else {
            return Ok(());
        };
        let sample_interval = self.inner.config.app.stats.sample_interval;
        let task_inner = Arc::clone(&self.inner);

        let def = ServiceDefinition::builder("stats", STATS_SLUG)
            .on_tick(|_, _, _| Ok(()))
            .on_tock(move |_session, _elapsed, _load| {
                let task_count = task_inner.task_count.load(Ordering::SeqCst);
                stats.sample(task_count);
                Ok(())
            })
            .throttle_ticks(sample_interval)
            .build();
        self.register(def).await
    }

    /// Starts every registered container concurrently, then the cron
    /// scheduler, the master tick loop and (if enabled) the stats profiler
    /// service. An individual container's start failure is retried per its
    /// own policy and otherwise logged; it does not by itself keep the
    /// engine out of `Running`.
    pub async fn start(&self) -> Result<(), EngineError> {
        *self.inner.state.write().expect("engine state lock poisoned") = EngineState::Starting;

        self.register_stats_service().await?;
        self.spawn_dispatch_loop();
        spawn_master_tick_loop(&self.inner);

        let paths: Vec<String> = self
            .inner
            .containers
            .read()
            .expect("containers lock poisoned")
            .keys()
            .cloned()
            .collect();

        let session = self.session();
        let starts = paths.iter().map(|path| start_one(&self.inner, path, &[], &session));
        futures::future::join_all(starts).await;

        tokio::spawn({
            let cron = Arc::clone(&self.cron);
            let session: Arc<dyn Session> = Arc::new(self.session());
            let cancel = self.inner.cancel.clone();
            async move { cron.run(session, cancel).await }
        });

        *self.inner.state.write().expect("engine state lock poisoned") = EngineState::Running;
        info!(services = paths.len(), "engine running");
        Ok(())
    }

    /// Starts one container by address path. Exposed so a
    /// `services.start.services` bundle event and an external caller share
    /// the same retry-driving path as the initial bring-up in [`Engine::start`].
    pub async fn service_start(&self, path: impl Into<String>) -> Result<(), EngineError> {
        let session = self.session();
        start_one(&self.inner, &path.into(), &[], &session).await
    }

    /// Same as [`Engine::service_start`], but merges `query` onto the
    /// container's resolved address before starting it.
    pub async fn service_start_with_query(&self, path: impl Into<String>, query: Vec<(String, String)>) -> Result<(), EngineError> {
        let session = self.session();
        start_one(&self.inner, &path.into(), &query, &session).await
    }

    pub async fn service_stop(&self, path: impl Into<String>, err: Option<EngineError>) -> Result<(), EngineError> {
        let session = self.session();
        stop_one(&self.inner, &path.into(), err, &session).await
    }

    fn spawn_dispatch_loop(&self) {
        let mut guard = self.event_rx.try_lock().expect("event receiver already taken");
        let mut rx = guard.take().expect("engine started twice");
        drop(guard);

        let inner = Arc::clone(&self.inner);
        let session = self.session();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        dispatch_one(&inner, &session, event).await;
                    }
                }
            }
        });
    }

    /// Stops every container in the reverse of its registration order. A
    /// container still locked gets a 1s grace period before being placed in
    /// a quarantine set; quarantined containers are drained concurrently by
    /// [`join_quarantined`], which escalates to `force_shutdown` if they
    /// never unlock. Waits, up to `deadline`, for every stop/escalation to finish.
    pub async fn shutdown(&self, deadline: Duration) {
        *self.inner.state.write().expect("engine state lock poisoned") = EngineState::Stopping;
        self.inner.cancel.cancel();

        let order: Vec<String> = self
            .inner
            .registration_order
            .read()
            .expect("registration order lock poisoned")
            .iter()
            .rev()
            .cloned()
            .collect();
        let session = self.session();
        let mut quarantined = Vec::new();

        for path in &order {
            let Some(container) = self.inner.container(path) else {
                continue;
            };
            if !container.info().running() {
                continue;
            }
            if container.is_locked() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if container.is_locked() {
                    warn!(service = path.as_str(), "still locked after grace period, quarantining");
                    quarantined.push(path.clone());
                    continue;
                }
            }
            let guard = self.shutdown_counter.begin();
            if let Err(e) = stop_one(&self.inner, path, None, &session).await {
                error!(service = path.as_str(), %e, "service failed to stop cleanly");
            }
            drop(guard);
        }

        if !quarantined.is_empty() {
            let joiners = quarantined.into_iter().map(|path| {
                let inner = Arc::clone(&self.inner);
                let session = session.clone();
                let shutdown_counter = Arc::clone(&self.shutdown_counter);
                async move {
                    let guard = shutdown_counter.begin();
                    join_quarantined(&inner, &path, &session).await;
                    drop(guard);
                }
            });
            futures::future::join_all(joiners).await;
        }

        if !self.shutdown_counter.wait(deadline).await {
            warn!("shutdown deadline elapsed with stop hooks still outstanding");
        }
        *self.inner.state.write().expect("engine state lock poisoned") = EngineState::Stopped;
        info!("engine stopped");
    }

    /// Blocks until something calls `destroy` on the session (or the
    /// process's own cancellation token is cancelled externally), then runs
    /// the shutdown sequence.
    pub async fn run_until_shutdown(&self, deadline: Duration) {
        self.inner.cancel.cancelled().await;
        if self.state() != EngineState::Stopped {
            self.shutdown(deadline).await;
        }
    }
}

/// Handles one event off the dispatch queue: drops anything nobody
/// subscribed to, runs the `services.start.services`/`services.stop.services`
/// scoped shortcut when it applies, and *also* fans the event out to every
/// container's own listeners. Both paths run on every dispatched event --
/// deliberate, not an either/or.
async fn dispatch_one(inner: &Arc<EngineInner>, session: &RuntimeSession, event: Event) {
    let key = event.subscription_key();
    if event.is_degenerate() || !inner.subscriptions.read().expect("subscriptions lock poisoned").contains(&key) {
        debug!(subscription = key.as_str(), "event not registered, dropping");
        return;
    }
    if event.value().is_nil() {
        warn!(subscription = key.as_str(), "dispatched event carries a nil scalar");
    }
    debug!(subscription = key.as_str(), "dispatching event");

    if event.scope() == SERVICES_SCOPE && (event.key() == START_SERVICES_KEY || event.key() == STOP_SERVICES_KEY) {
        let mut paths: Vec<String> = event
            .payload()
            .map(|payload| {
                payload
                    .values()
                    .filter_map(|v| match v {
                        EventValue::Str(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(slug) = event.value().as_slug() {
            if let Ok(addr) = inner.resolver.resolve_service(slug) {
                paths.push(addr.path());
            }
        }

        let inner = Arc::clone(inner);
        let session = session.clone();
        let starting = event.key() == START_SERVICES_KEY;
        tokio::spawn(async move {
            for path in paths {
                let result = if starting {
                    start_one(&inner, &path, &[], &session).await
                } else {
                    stop_one(&inner, &path, Some(EngineError::ServiceTerminated), &session).await
                };
                if let Err(e) = result {
                    warn!(path = path.as_str(), %e, "bundle-driven service operation failed");
                }
            }
        });
    }

    let containers: Vec<Arc<Container>> = inner
        .containers
        .read()
        .expect("containers lock poisoned")
        .values()
        .cloned()
        .collect();
    let futures = containers.iter().map(|c| {
        let session = session.clone();
        let event = event.clone();
        let key = key.clone();
        async move {
            if let Err(e) = c.handle_event(&session, &event).await {
                warn!(service = c.slug(), subscription = key.as_str(), %e, "listener failed");
            }
        }
    });
    futures::future::join_all(futures).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::config::{AppConfig, EngineSection, ServicesSection, StatsSection};

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
    async fn register_and_start_reaches_running() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("lidar", "lidar").on_start(|_| Ok(())).build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.shutdown(Duration::from_secs(1)).await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn rejects_invalid_definition() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("", "").build();
        assert!(engine.register(def).await.is_err());
    }

    #[tokio::test]
    async fn rejects_duplicate_address() {
        let engine = Engine::new(test_config()).unwrap();
        engine.register(ServiceDefinition::builder("lidar", "lidar").build()).await.unwrap();
        let err = engine.register(ServiceDefinition::builder("lidar-2", "lidar").build()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn destroy_triggers_shutdown() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("lidar", "lidar").build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();

        let session = engine.session();
        session.destroy(None);

        tokio::time::timeout(Duration::from_secs(1), engine.run_until_shutdown(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn listener_fires_for_registered_subscription_key() {
        use std::sync::atomic::AtomicBool;

        let engine = Engine::new(test_config()).unwrap();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);
        let def = ServiceDefinition::builder("watchdog", "watchdog")
            .on_event("app.ping", move |_, _| {
                seen2.store(true, Ordering::SeqCst);
                Ok(())
            })
            .build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();

        engine.dispatch(Event::new("app", "ping", EventValue::Bool(true)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.load(Ordering::SeqCst));
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unregistered_event_is_dropped_without_panicking() {
        let engine = Engine::new(test_config()).unwrap();
        engine.start().await.unwrap();
        assert!(!engine.is_registered_event("app.ping"));
        engine.dispatch(Event::new("app", "ping", EventValue::Bool(true)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn bundle_start_event_starts_named_services() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("lidar", "lidar")
            .on_start(|_| Ok(()))
            .build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();

        let path = engine.resolve("lidar").unwrap().path();
        let payload = warden_core::bundle_payload([path.as_str()]);
        engine.dispatch(Event::new("services", "start.services", EventValue::from("bundle")).with_payload(payload));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.info(&path).unwrap().running());
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn master_tick_loop_and_watcher_are_tracked_tasks() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("watchdog", "watchdog").on_start(|_| Ok(())).build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();

        // The master tick loop plus the watchdog's watcher (it has no tick
        // callback) should both be live, independent of any service's own loop.
        assert!(engine.task_count() >= 2);
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stats_service_samples_when_enabled_and_is_readable_from_the_session() {
        let mut config = test_config();
        config.app.stats.enabled = true;
        config.app.stats.sample_interval = Duration::from_millis(5);
        let engine = Engine::new(config).unwrap();
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let snapshot = engine.session().stats();
        assert!(snapshot.is_some(), "stats service should have sampled at least once");
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn service_start_with_query_merges_query_params() {
        let engine = Engine::new(test_config()).unwrap();
        let def = ServiceDefinition::builder("lidar", "lidar").build();
        engine.register(def).await.unwrap();
        engine.start().await.unwrap();

        let path = engine.resolve("lidar").unwrap().path();
        engine.service_stop(path.clone(), None).await.unwrap();
        engine
            .service_start_with_query(path.clone(), vec![("replay".to_string(), "true".to_string())])
            .await
            .unwrap();

        let addr = engine.info(&path).unwrap().address().unwrap();
        assert_eq!(addr.query("replay"), Some("true"));
        engine.shutdown(Duration::from_secs(1)).await;
    }
}
