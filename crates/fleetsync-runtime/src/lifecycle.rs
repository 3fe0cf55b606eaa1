//! [`Orchestrator`] – ordered startup and teardown of the engine.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──ok──▶ Initialized
//!       ▲                            │ err                 │
//!       │                            ▼                     │ cleanup
//!       └──────────────────────── CleaningUp ◀─────────────┤
//!                                                          │ soft_cleanup
//!                                   SoftCleaned ◀──────────┘
//!                                        │ initialize (connection reused)
//!                                        ▼
//!                                   Initializing
//! ```
//!
//! # Initialization order
//!
//! 1. [`InitStep::TransportConnection`] – join the bus partition (skipped
//!    when a soft cleanup kept the connection).
//! 2. [`InitStep::DataProcessing`] – wire store updates to `ContextUpdated`
//!    notifications.
//! 3. [`InitStep::DependentManagers`] – ingestion manager and goal
//!    dispatcher, each built once and memoized.
//! 4. [`InitStep::IngestionSubscriptions`] – every telemetry category plus
//!    the flush timer.
//! 5. [`InitStep::OutwardSocket`] – only when a host is configured; the
//!    socket is sent a snapshot of the context once connected.
//!
//! A failing step triggers a full cleanup before the failure is returned.
//! Cleanup steps are isolated from each other: an error is recorded in the
//! [`CleanupReport`] and the next step still runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleetsync_context::{ContextStore, ContextUpdate, ObserverId, StateTransformer};
use fleetsync_middleware::{
    EventBus, GoalTransport, MapDataSource, OutwardSocket, TelemetryTransport, Topic,
};
use fleetsync_types::{
    EventPayload, FleetError, GoalOutput, LifecycleEvent, MapData, StreamCategory,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dedup::RequestCache;
use crate::dispatch::{CallerContext, GoalDispatcher};
use crate::ingestion::{IngestionManager, MessageStats};

const SOURCE: &str = "fleetsync-runtime::lifecycle";

/// Cache key of the building map.
pub const MAP_DATA_KEY: &str = "map_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Initialized,
    CleaningUp,
    /// Subscriptions and socket released; connection and context kept.
    SoftCleaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStep {
    TransportConnection,
    DataProcessing,
    DependentManagers,
    IngestionSubscriptions,
    OutwardSocket,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitStep::TransportConnection => "transport_connection",
            InitStep::DataProcessing => "data_processing",
            InitStep::DependentManagers => "dependent_managers",
            InitStep::IngestionSubscriptions => "ingestion_subscriptions",
            InitStep::OutwardSocket => "outward_socket",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    TaskSubscriptions,
    DependentManagers,
    IngestionSubscriptions,
    ConnectionResources,
    SharedSocket,
    ContextStore,
}

/// Result of [`Orchestrator::initialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Initialized { steps: Vec<InitStep> },
    /// Already initialized; nothing was done.
    AlreadyInitialized,
    /// Another lifecycle operation is running; nothing was done.
    Busy,
    /// `failed_step` failed; the steps in `completed` were rolled back.
    Failed {
        failed_step: InitStep,
        error: FleetError,
        completed: Vec<InitStep>,
    },
}

impl InitOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, InitOutcome::Initialized { .. } | InitOutcome::AlreadyInitialized)
    }
}

/// Result of [`Orchestrator::cleanup`] and [`Orchestrator::soft_cleanup`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub completed: Vec<CleanupStep>,
    pub failed: Vec<(CleanupStep, FleetError)>,
    /// Another lifecycle operation was running; nothing was done.
    pub busy: bool,
}

impl CleanupReport {
    fn busy() -> Self {
        Self { busy: true, ..Self::default() }
    }

    pub fn is_clean(&self) -> bool {
        !self.busy && self.failed.is_empty()
    }

    fn record(&mut self, step: CleanupStep, result: Result<(), FleetError>) {
        match result {
            Ok(()) => self.completed.push(step),
            Err(e) => {
                warn!(?step, error = %e, "cleanup step failed");
                self.failed.push((step, e));
            }
        }
    }
}

/// Map fetch counters reported by [`Orchestrator::map_cache_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MapCacheStats {
    /// Requests actually sent to the map source.
    pub fetches: u64,
    pub in_flight: bool,
}

/// External collaborators the engine is started against.
#[derive(Clone)]
pub struct EngineServices {
    pub telemetry: Arc<dyn TelemetryTransport>,
    pub map_source: Arc<dyn MapDataSource>,
    pub goals: Arc<dyn GoalTransport>,
    pub socket: Option<Arc<dyn OutwardSocket>>,
}

#[derive(Default)]
struct Managers {
    ingestion: Option<Arc<IngestionManager>>,
    dispatcher: Option<Arc<GoalDispatcher>>,
    observer: Option<ObserverId>,
}

struct Lifecycle {
    state: LifecycleState,
    steps: Vec<InitStep>,
    connection_retained: bool,
    config: EngineConfig,
}

pub struct Orchestrator {
    services: EngineServices,
    bus: Arc<EventBus>,
    store: Arc<ContextStore>,
    transformer: Arc<StateTransformer>,
    map_cache: RequestCache<Option<MapData>>,
    lifecycle: Mutex<Lifecycle>,
    managers: Mutex<Managers>,
}

impl Orchestrator {
    pub fn new(services: EngineServices, bus: Arc<EventBus>) -> Self {
        let store = Arc::new(ContextStore::new());
        let transformer = Arc::new(StateTransformer::new(Arc::clone(&store)));
        Self {
            services,
            bus,
            store,
            transformer,
            map_cache: RequestCache::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Uninitialized,
                steps: Vec::new(),
                connection_retained: false,
                config: EngineConfig::default(),
            }),
            managers: Mutex::new(Managers::default()),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn managers(&self) -> MutexGuard<'_, Managers> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        self.lifecycle().state = state;
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    /// Steps completed by the most recent initialization, in order.
    pub fn init_steps(&self) -> Vec<InitStep> {
        self.lifecycle().steps.clone()
    }

    pub fn ingestion(&self) -> Option<Arc<IngestionManager>> {
        self.managers().ingestion.clone()
    }

    pub fn dispatcher(&self) -> Option<Arc<GoalDispatcher>> {
        self.managers().dispatcher.clone()
    }

    // ── initialize ───────────────────────────────────────────────────────────

    #[instrument(skip_all, fields(domain_id = config.domain_id))]
    pub async fn initialize(&self, config: EngineConfig) -> InitOutcome {
        let reuse_connection = {
            let mut lc = self.lifecycle();
            match lc.state {
                LifecycleState::Initialized => return InitOutcome::AlreadyInitialized,
                LifecycleState::Initializing | LifecycleState::CleaningUp => {
                    info!(state = ?lc.state, "lifecycle busy");
                    return InitOutcome::Busy;
                }
                LifecycleState::Uninitialized | LifecycleState::SoftCleaned => {}
            }
            lc.state = LifecycleState::Initializing;
            lc.steps.clear();
            lc.config = config.clone();
            lc.connection_retained
        };

        if let Err(e) = config.validate() {
            return self.fail(InitStep::DependentManagers, e, Vec::new()).await;
        }

        let mut completed = Vec::new();
        let plan = [
            InitStep::TransportConnection,
            InitStep::DataProcessing,
            InitStep::DependentManagers,
            InitStep::IngestionSubscriptions,
            InitStep::OutwardSocket,
        ];
        for step in plan {
            let run = match step {
                InitStep::TransportConnection => !reuse_connection,
                InitStep::OutwardSocket => config.socket_target().is_some(),
                _ => true,
            };
            if !run {
                continue;
            }
            match self.run_init_step(step, &config).await {
                Ok(()) => {
                    info!(%step, "init step complete");
                    completed.push(step);
                    self.lifecycle().steps.push(step);
                }
                Err(e) => return self.fail(step, e, completed).await,
            }
        }

        {
            let mut lc = self.lifecycle();
            lc.state = LifecycleState::Initialized;
            lc.connection_retained = false;
        }
        info!(steps = completed.len(), "engine initialized");
        self.bus.lifecycle(SOURCE, LifecycleEvent::Ready);
        InitOutcome::Initialized { steps: completed }
    }

    async fn run_init_step(&self, step: InitStep, config: &EngineConfig) -> Result<(), FleetError> {
        match step {
            InitStep::TransportConnection => self.services.telemetry.connect(config.domain_id).await,
            InitStep::DataProcessing => {
                let mut managers = self.managers();
                if managers.observer.is_none() {
                    let bus = Arc::clone(&self.bus);
                    let id = self.transformer.register_observer(Arc::new(move |update: &ContextUpdate| {
                        bus.notify(
                            Topic::Context,
                            SOURCE,
                            EventPayload::ContextUpdated {
                                category: update.category,
                                key: update.key.clone(),
                            },
                        );
                    }));
                    managers.observer = Some(id);
                }
                Ok(())
            }
            InitStep::DependentManagers => {
                let mut managers = self.managers();
                match &managers.ingestion {
                    Some(existing) => {
                        existing.set_quiet(config.quiet_logging);
                        for category in StreamCategory::ALL {
                            let ms = config.throttle_interval(category).as_millis() as u64;
                            existing.set_throttle_interval(category, ms)?;
                        }
                    }
                    None => {
                        managers.ingestion = Some(Arc::new(IngestionManager::from_config(
                            Arc::clone(&self.transformer),
                            config,
                        )?));
                    }
                }
                let dispatcher = managers.dispatcher.get_or_insert_with(|| {
                    Arc::new(GoalDispatcher::new(
                        Arc::clone(&self.store),
                        Arc::clone(&self.services.goals),
                    ))
                });
                dispatcher.set_quiet(config.quiet_logging);
                Ok(())
            }
            InitStep::IngestionSubscriptions => {
                let ingestion = self.ingestion().ok_or_else(|| {
                    FleetError::Unavailable("ingestion manager not constructed".to_string())
                })?;
                for category in StreamCategory::ALL {
                    ingestion.subscribe(category, self.services.telemetry.as_ref())?;
                }
                ingestion.start_flush_task(config.flush_tick());
                Ok(())
            }
            InitStep::OutwardSocket => {
                let (Some(target), Some(socket)) = (config.socket_target(), &self.services.socket)
                else {
                    warn!("outward socket configured but no socket implementation provided");
                    return Ok(());
                };
                socket.connect(&target).await?;
                // A dashboard joining late still needs the current context.
                if let Err(e) = socket.send(self.snapshot_frame()?).await {
                    warn!(error = %e, "failed to send context snapshot");
                }
                Ok(())
            }
        }
    }

    fn snapshot_frame(&self) -> Result<String, FleetError> {
        let frame = json!({ "type": "context_snapshot", "context": self.store.snapshot() });
        serde_json::to_string(&frame).map_err(|e| FleetError::Serialization(e.to_string()))
    }

    async fn fail(&self, step: InitStep, e: FleetError, completed: Vec<InitStep>) -> InitOutcome {
        let error = match e {
            FleetError::Initialization { .. } => e,
            other => FleetError::Initialization {
                step: step.to_string(),
                details: other.to_string(),
            },
        };
        error!(%step, error = %error, "initialization failed; rolling back");
        self.bus.lifecycle(SOURCE, LifecycleEvent::Error(error.to_string()));

        self.set_state(LifecycleState::CleaningUp);
        let report = self.teardown().await;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "rollback left failed cleanup steps");
        }
        {
            let mut lc = self.lifecycle();
            lc.state = LifecycleState::Uninitialized;
            lc.steps.clear();
            lc.connection_retained = false;
        }
        InitOutcome::Failed {
            failed_step: step,
            error,
            completed,
        }
    }

    // ── cleanup ──────────────────────────────────────────────────────────────

    /// Full teardown.  Safe to call in any state except while another
    /// lifecycle operation is running.
    #[instrument(skip_all)]
    pub async fn cleanup(&self) -> CleanupReport {
        {
            let mut lc = self.lifecycle();
            if matches!(lc.state, LifecycleState::Initializing | LifecycleState::CleaningUp) {
                return CleanupReport::busy();
            }
            lc.state = LifecycleState::CleaningUp;
        }

        let report = self.teardown().await;
        {
            let mut lc = self.lifecycle();
            lc.state = LifecycleState::Uninitialized;
            lc.steps.clear();
            lc.connection_retained = false;
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "engine cleaned up"
        );
        self.bus.lifecycle(SOURCE, LifecycleEvent::CleanedUp);
        report
    }

    async fn teardown(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let telemetry = self.services.telemetry.as_ref();

        let ingestion = self.ingestion();
        report.record(
            CleanupStep::TaskSubscriptions,
            match &ingestion {
                Some(m) => m.unsubscribe(StreamCategory::DynamicEvent, telemetry),
                None => Ok(()),
            },
        );

        report.record(CleanupStep::DependentManagers, {
            let mut managers = self.managers();
            managers.dispatcher = None;
            if let Some(id) = managers.observer.take() {
                self.transformer.unregister_observer(id);
            }
            Ok(())
        });

        let ingestion = self.managers().ingestion.take();
        report.record(
            CleanupStep::IngestionSubscriptions,
            match ingestion {
                Some(m) => {
                    m.stop_flush_task();
                    let result = m.unsubscribe_all(telemetry);
                    m.reset();
                    result
                }
                None => Ok(()),
            },
        );

        report.record(CleanupStep::ConnectionResources, telemetry.disconnect().await);

        report.record(
            CleanupStep::SharedSocket,
            match &self.services.socket {
                Some(socket) => socket.disconnect().await,
                None => Ok(()),
            },
        );

        report.record(CleanupStep::ContextStore, {
            self.store.clear();
            self.map_cache.clear();
            Ok(())
        });

        report
    }

    /// Release subscriptions and the outward socket for a redeploy, keeping
    /// the transport connection and the context.
    #[instrument(skip_all)]
    pub async fn soft_cleanup(&self) -> CleanupReport {
        {
            let mut lc = self.lifecycle();
            match lc.state {
                LifecycleState::Initialized => lc.state = LifecycleState::CleaningUp,
                LifecycleState::Initializing | LifecycleState::CleaningUp => {
                    return CleanupReport::busy();
                }
                LifecycleState::Uninitialized | LifecycleState::SoftCleaned => {
                    return CleanupReport::default();
                }
            }
        }

        let mut report = CleanupReport::default();
        let telemetry = self.services.telemetry.as_ref();
        let ingestion = self.ingestion();
        report.record(
            CleanupStep::TaskSubscriptions,
            match &ingestion {
                Some(m) => m.unsubscribe(StreamCategory::DynamicEvent, telemetry),
                None => Ok(()),
            },
        );
        report.record(
            CleanupStep::IngestionSubscriptions,
            match &ingestion {
                Some(m) => {
                    m.stop_flush_task();
                    m.unsubscribe_all(telemetry)
                }
                None => Ok(()),
            },
        );
        report.record(
            CleanupStep::SharedSocket,
            match &self.services.socket {
                Some(socket) => socket.disconnect().await,
                None => Ok(()),
            },
        );

        {
            let mut lc = self.lifecycle();
            lc.state = LifecycleState::SoftCleaned;
            lc.connection_retained = true;
        }
        info!("engine soft-cleaned; connection and context retained");
        report
    }

    // ── map data ─────────────────────────────────────────────────────────────

    /// Fetch the building map through the dedup cache and merge it into
    /// the context.  A map fetched across a full cleanup is not applied.
    pub async fn fetch_map_data(&self) -> Result<Option<MapData>, FleetError> {
        let generation = self.store.generation();
        let ttl = self.lifecycle().config.map_cache_ttl();
        let source = Arc::clone(&self.services.map_source);
        let map = self
            .map_cache
            .get(MAP_DATA_KEY, ttl, move || async move { source.fetch_map_data().await })
            .await?;

        if let Some(map) = &map {
            self.transformer.apply_map_data(map, generation)?;
        }
        Ok(map)
    }

    /// Drop the cached map and fetch it again.  Joins a fetch that is
    /// already running instead of starting a second one.
    pub async fn refresh_map_data(&self) -> Result<Option<MapData>, FleetError> {
        self.map_cache.invalidate(MAP_DATA_KEY);
        self.fetch_map_data().await
    }

    pub fn map_cache_stats(&self) -> MapCacheStats {
        MapCacheStats {
            fetches: self.map_cache.fetch_count(),
            in_flight: self.map_cache.is_in_flight(MAP_DATA_KEY),
        }
    }

    // ── goals ────────────────────────────────────────────────────────────────

    pub async fn send_goal(
        &self,
        category: &str,
        event_data: Value,
        success_template: Value,
        caller: &CallerContext,
    ) -> mpsc::Receiver<GoalOutput> {
        match self.dispatcher() {
            Some(d) => d.send_goal(category, event_data, success_template, caller).await,
            None => {
                let (tx, rx) = mpsc::channel(1);
                let e = FleetError::Unavailable("engine not initialized".to_string());
                let _ = tx.try_send(GoalOutput::failure(json!({ "error": e.to_string() })));
                rx
            }
        }
    }

    // ── diagnostics ──────────────────────────────────────────────────────────

    pub fn message_stats(&self) -> BTreeMap<StreamCategory, MessageStats> {
        self.ingestion()
            .map(|m| m.message_stats())
            .unwrap_or_default()
    }

    pub fn force_process_latest(&self, category: StreamCategory) -> usize {
        self.ingestion()
            .map(|m| m.force_process_latest(category))
            .unwrap_or(0)
    }

    pub fn force_process_all(&self) -> usize {
        self.ingestion().map(|m| m.force_process_all()).unwrap_or(0)
    }

    pub fn set_throttle_interval(
        &self,
        category: StreamCategory,
        interval_ms: u64,
    ) -> Result<(), FleetError> {
        let ingestion = self
            .ingestion()
            .ok_or_else(|| FleetError::Unavailable("engine not initialized".to_string()))?;
        ingestion.set_throttle_interval(category, interval_ms)?;
        self.lifecycle()
            .config
            .throttle
            .insert(category.as_str().to_string(), interval_ms);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_middleware::SimTransport;
    use fleetsync_types::Event;

    fn orchestrator() -> (Orchestrator, Arc<SimTransport>) {
        let sim = Arc::new(SimTransport::new());
        let services = EngineServices {
            telemetry: sim.clone(),
            map_source: sim.clone(),
            goals: sim.clone(),
            socket: None,
        };
        (Orchestrator::new(services, Arc::new(EventBus::default())), sim)
    }

    fn lifecycle_names(events: &mut fleetsync_middleware::TopicReceiver) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(Event { payload: EventPayload::Lifecycle(ev), .. }) = events.try_recv() {
            names.push(ev.name());
        }
        names
    }

    #[tokio::test]
    async fn initialize_runs_steps_in_order() {
        let (o, sim) = orchestrator();
        let mut events = o.bus().subscribe_to(Topic::Lifecycle);

        let outcome = o.initialize(EngineConfig::default()).await;
        assert_eq!(
            outcome,
            InitOutcome::Initialized {
                steps: vec![
                    InitStep::TransportConnection,
                    InitStep::DataProcessing,
                    InitStep::DependentManagers,
                    InitStep::IngestionSubscriptions,
                ]
            }
        );
        assert_eq!(o.lifecycle_state(), LifecycleState::Initialized);
        assert_eq!(sim.subscription_count(), 6);
        assert_eq!(lifecycle_names(&mut events), vec!["ready"]);

        assert_eq!(o.initialize(EngineConfig::default()).await, InitOutcome::AlreadyInitialized);
        assert_eq!(sim.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_initialize_is_busy() {
        let (o, sim) = orchestrator();
        sim.set_connect_delay(Some(std::time::Duration::from_millis(100)));

        let (first, second) = tokio::join!(
            o.initialize(EngineConfig::default()),
            o.initialize(EngineConfig::default())
        );
        assert!(matches!(first, InitOutcome::Initialized { .. }));
        assert_eq!(second, InitOutcome::Busy);
        assert!(o.cleanup().await.is_clean());
    }

    #[tokio::test]
    async fn failed_step_rolls_back() {
        let (o, sim) = orchestrator();
        sim.fail_subscribe(Some("lift_states"));

        match o.initialize(EngineConfig::default()).await {
            InitOutcome::Failed { failed_step, error, completed } => {
                assert_eq!(failed_step, InitStep::IngestionSubscriptions);
                assert!(matches!(error, FleetError::Initialization { .. }));
                assert_eq!(completed.len(), 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(o.lifecycle_state(), LifecycleState::Uninitialized);
        assert_eq!(sim.subscription_count(), 0);
        assert!(!sim.is_connected());
        assert!(o.ingestion().is_none());
    }

    #[tokio::test]
    async fn connection_failure_reports_first_step() {
        let (o, sim) = orchestrator();
        sim.fail_connect_with(Some(FleetError::Connection("bad credentials".into())));
        match o.initialize(EngineConfig::default()).await {
            InitOutcome::Failed { failed_step, completed, .. } => {
                assert_eq!(failed_step, InitStep::TransportConnection);
                assert!(completed.is_empty());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_steps_are_isolated() {
        let (o, sim) = orchestrator();
        assert!(o.initialize(EngineConfig::default()).await.is_ok());
        sim.fail_disconnect_with(Some(FleetError::Connection("socket stuck".into())));
        o.store().update(|s| s.touch(StreamCategory::DoorState));

        let report = o.cleanup().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, CleanupStep::ConnectionResources);
        assert!(report.completed.contains(&CleanupStep::SharedSocket));
        assert!(report.completed.contains(&CleanupStep::ContextStore));
        assert!(o.store().last_updated(StreamCategory::DoorState).is_none());
        assert_eq!(o.lifecycle_state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn cleanup_without_initialize_is_clean() {
        let (o, _) = orchestrator();
        let mut events = o.bus().subscribe_to(Topic::Lifecycle);
        let report = o.cleanup().await;
        assert!(report.is_clean());
        assert_eq!(lifecycle_names(&mut events), vec!["cleanedUp"]);
    }

    #[tokio::test]
    async fn soft_cleanup_keeps_connection_and_context() {
        let (o, sim) = orchestrator();
        o.initialize(EngineConfig::default()).await;
        o.store().update(|s| s.touch(StreamCategory::FleetState));

        let report = o.soft_cleanup().await;
        assert!(report.is_clean());
        assert_eq!(o.lifecycle_state(), LifecycleState::SoftCleaned);
        assert!(sim.is_connected());
        assert_eq!(sim.subscription_count(), 0);
        assert!(o.store().last_updated(StreamCategory::FleetState).is_some());

        let outcome = o.initialize(EngineConfig::default()).await;
        match outcome {
            InitOutcome::Initialized { steps } => {
                assert!(!steps.contains(&InitStep::TransportConnection));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(sim.connect_calls(), 1);
        assert_eq!(sim.subscription_count(), 6);
    }

    #[tokio::test]
    async fn context_updates_reach_the_bus() {
        let (o, sim) = orchestrator();
        let mut context = o.bus().subscribe_to(Topic::Context);
        o.initialize(EngineConfig::default()).await;

        sim.emit(
            "nav_graphs",
            fleetsync_types::TelemetryMessage::NavGraph(fleetsync_types::message::RawNavGraph {
                name: Some("fleet1".into()),
                ..Default::default()
            }),
        );
        let event = context.try_recv().expect("context event");
        assert!(matches!(
            event.payload,
            EventPayload::ContextUpdated { category: StreamCategory::NavGraph, ref key } if key == "fleet1"
        ));
    }

    #[tokio::test]
    async fn diagnostics_require_initialization() {
        let (o, _) = orchestrator();
        assert!(o.message_stats().is_empty());
        assert_eq!(o.force_process_all(), 0);
        assert!(o.set_throttle_interval(StreamCategory::DoorState, 10).is_err());

        o.initialize(EngineConfig::default()).await;
        o.set_throttle_interval(StreamCategory::DoorState, 10).unwrap();
        assert_eq!(o.message_stats()[&StreamCategory::DoorState].interval_ms, 10);
    }

    #[derive(Default)]
    struct RecordingSocket {
        frames: Mutex<Vec<String>>,
        connected: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl OutwardSocket for RecordingSocket {
        async fn connect(&self, _target: &fleetsync_middleware::SocketTarget) -> Result<(), FleetError> {
            self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, frame: String) -> Result<(), FleetError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), FleetError> {
            self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn socket_receives_context_snapshot_on_connect() {
        let sim = Arc::new(SimTransport::new());
        let socket = Arc::new(RecordingSocket::default());
        let services = EngineServices {
            telemetry: sim.clone(),
            map_source: sim.clone(),
            goals: sim.clone(),
            socket: Some(socket.clone() as Arc<dyn OutwardSocket>),
        };
        let o = Orchestrator::new(services, Arc::new(EventBus::default()));
        o.store().update(|s| s.upsert_robot(fleetsync_types::Robot::placeholder("r1", "fleetA")));

        let config = EngineConfig { host: Some("dashboard.local".into()), ..Default::default() };
        match o.initialize(config).await {
            InitOutcome::Initialized { steps } => assert_eq!(steps.last(), Some(&InitStep::OutwardSocket)),
            other => panic!("unexpected outcome {other:?}"),
        }

        let frames = socket.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "context_snapshot");
        assert_eq!(frame["context"]["robots"][0]["name"], "r1");
        assert!(socket.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_map_data_bypasses_cache() {
        let (o, sim) = orchestrator();
        o.initialize(EngineConfig::default()).await;
        sim.set_map_data(Some(MapData { building_name: "hq".into(), ..Default::default() }));

        o.fetch_map_data().await.unwrap();
        o.fetch_map_data().await.unwrap();
        assert_eq!(o.map_cache_stats(), MapCacheStats { fetches: 1, in_flight: false });

        sim.set_map_data(Some(MapData { building_name: "annex".into(), ..Default::default() }));
        let map = o.refresh_map_data().await.unwrap().unwrap();
        assert_eq!(map.building_name, "annex");
        assert_eq!(sim.map_fetch_count(), 2);
        assert_eq!(o.map_cache_stats().fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn map_cache_stats_show_running_fetch() {
        let (o, sim) = orchestrator();
        o.initialize(EngineConfig::default()).await;
        sim.set_map_delay(Some(std::time::Duration::from_millis(100)));

        let fetch = o.fetch_map_data();
        let check = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            o.map_cache_stats()
        };
        let (result, during) = tokio::join!(fetch, check);
        assert!(result.is_ok());
        assert!(during.in_flight);
        assert!(!o.map_cache_stats().in_flight);
    }

    #[tokio::test]
    async fn goal_before_initialize_fails_fast() {
        let (o, _) = orchestrator();
        let mut rx = o
            .send_goal("go_to_place", json!({}), json!({}), &CallerContext::robot("r1", "f"))
            .await;
        assert!(rx.recv().await.unwrap().failure.is_some());
        assert!(rx.recv().await.is_none());
    }
}
