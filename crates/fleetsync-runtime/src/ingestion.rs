//! [`IngestionManager`] – subscriptions, throttling and coalescing.
//!
//! Every message arriving from a subscribed topic goes through the same
//! path:
//!
//! 1. **Count** – the category's `received` counter is bumped.
//! 2. **Retain** – the message replaces any pending message with the same
//!    coalescing key (fleet, door, lift or graph name; kind plus
//!    `fleet/robot` for dynamic events).
//! 3. **Coalesce** – if the category's [`ThrottlePolicy`] is due, every
//!    pending message is handed to the [`StateTransformer`] in arrival order
//!    and the window restarts.  Otherwise the messages wait for a later
//!    arrival or for the flush timer.
//!
//! Navigation graphs skip step 3: they are applied on arrival and
//! additionally retained for a slower secondary reprocess pass.
//!
//! The state mutex is held across take-and-transform so two callbacks
//! never interleave their store updates and a key's messages are applied
//! in the order they were selected.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetsync_context::StateTransformer;
use fleetsync_middleware::{MessageHandler, QosHint, SubscriptionId, TelemetryTransport};
use fleetsync_types::{FleetError, StreamCategory, TelemetryMessage};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, default_throttle_ms};
use crate::throttle::ThrottlePolicy;

const FLEET_TOPICS: &[&str] = &["fleet_states"];
const DOOR_TOPICS: &[&str] = &["door_states"];
const LIFT_TOPICS: &[&str] = &["lift_states"];
const NAV_TOPICS: &[&str] = &["nav_graphs"];
const DYNAMIC_EVENT_TOPICS: &[&str] = &["dynamic_event_begin", "dynamic_event_status"];

/// Bus topics carrying `category`.
pub fn topics_for(category: StreamCategory) -> &'static [&'static str] {
    match category {
        StreamCategory::FleetState => FLEET_TOPICS,
        StreamCategory::DoorState => DOOR_TOPICS,
        StreamCategory::LiftState => LIFT_TOPICS,
        StreamCategory::NavGraph => NAV_TOPICS,
        StreamCategory::DynamicEvent => DYNAMIC_EVENT_TOPICS,
    }
}

/// QoS requested for every topic of `category`.
pub fn qos_for(category: StreamCategory) -> QosHint {
    match category {
        StreamCategory::NavGraph => QosHint::latched(),
        StreamCategory::DynamicEvent => QosHint::reliable(),
        _ => QosHint::telemetry(),
    }
}

/// Per-category counters as reported by [`IngestionManager::message_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStats {
    pub received: u64,
    pub processed: u64,
    /// `received - processed`.
    pub skipped: u64,
    /// Messages the transformer rejected as malformed.
    pub failed: u64,
    pub interval_ms: u64,
    /// Time until the throttle window reopens, zero when a message would be
    /// processed on arrival.
    pub due_in_ms: u64,
    pub last_processed: Option<DateTime<Utc>>,
}

fn coalescing_key(msg: &TelemetryMessage) -> String {
    match msg {
        TelemetryMessage::DynamicEventBegin(_) => format!("begin:{}", msg.key()),
        TelemetryMessage::DynamicEventStatus(_) => format!("status:{}", msg.key()),
        _ => msg.key(),
    }
}

struct CategoryState {
    policy: ThrottlePolicy,
    /// Latest message per key, ordered by most recent arrival.
    pending: Vec<(String, TelemetryMessage)>,
    received: u64,
    processed: u64,
    failed: u64,
    last_processed: Option<DateTime<Utc>>,
    subscriptions: Vec<SubscriptionId>,
}

impl CategoryState {
    fn new(interval: Duration) -> Result<Self, FleetError> {
        Ok(Self {
            policy: ThrottlePolicy::new(interval)?,
            pending: Vec::new(),
            received: 0,
            processed: 0,
            failed: 0,
            last_processed: None,
            subscriptions: Vec::new(),
        })
    }

    fn retain(&mut self, key: String, msg: TelemetryMessage) {
        self.pending.retain(|(k, _)| *k != key);
        self.pending.push((key, msg));
    }

    fn take_pending(&mut self) -> Vec<TelemetryMessage> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(_, msg)| msg)
            .collect()
    }
}

#[derive(Default)]
struct IngestionState {
    categories: BTreeMap<StreamCategory, CategoryState>,
    intervals: HashMap<StreamCategory, Duration>,
}

impl IngestionState {
    fn interval(&self, category: StreamCategory) -> Duration {
        self.intervals
            .get(&category)
            .copied()
            .unwrap_or_else(|| Duration::from_millis(default_throttle_ms(category)))
    }

    fn category(&mut self, category: StreamCategory) -> Result<&mut CategoryState, FleetError> {
        let interval = self.interval(category);
        match self.categories.entry(category) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => Ok(e.insert(CategoryState::new(interval)?)),
        }
    }
}

pub struct IngestionManager {
    transformer: Arc<StateTransformer>,
    state: Mutex<IngestionState>,
    quiet: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionManager {
    pub fn new(transformer: Arc<StateTransformer>) -> Self {
        Self {
            transformer,
            state: Mutex::new(IngestionState::default()),
            quiet: AtomicBool::new(false),
            flush_task: Mutex::new(None),
        }
    }

    /// Build a manager with the intervals and logging mode from `config`.
    pub fn from_config(
        transformer: Arc<StateTransformer>,
        config: &EngineConfig,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let manager = Self::new(transformer);
        manager.set_quiet(config.quiet_logging);
        {
            let mut state = manager.state();
            for category in StreamCategory::ALL {
                state.intervals.insert(category, config.throttle_interval(category));
            }
        }
        Ok(manager)
    }

    fn state(&self) -> MutexGuard<'_, IngestionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transformer(&self) -> &Arc<StateTransformer> {
        &self.transformer
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::Relaxed);
    }

    fn quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Subscribe every topic of `category` on `transport`.
    ///
    /// Idempotent: an already subscribed category is left untouched.  On a
    /// partial failure the topics subscribed so far are released again.
    pub fn subscribe(
        self: &Arc<Self>,
        category: StreamCategory,
        transport: &dyn TelemetryTransport,
    ) -> Result<(), FleetError> {
        let policy = {
            let state = self.state();
            if state
                .categories
                .get(&category)
                .is_some_and(|c| !c.subscriptions.is_empty())
            {
                debug!(%category, "already subscribed");
                return Ok(());
            }
            ThrottlePolicy::new(state.interval(category))?
        };

        let mut ids = Vec::new();
        for topic in topics_for(category) {
            let weak: Weak<Self> = Arc::downgrade(self);
            let handler: MessageHandler = Arc::new(move |msg| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_message(msg);
                }
            });
            match transport.subscribe(topic, qos_for(category), handler) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        let _ = transport.unsubscribe(id);
                    }
                    return Err(e);
                }
            }
        }

        let mut state = self.state();
        let entry = state.category(category)?;
        // A fresh subscription opens a fresh throttle window.
        entry.policy = policy;
        entry.subscriptions = ids;
        info!(%category, "subscribed");
        Ok(())
    }

    /// Release `category`'s subscriptions.  Counters and pending messages
    /// are kept so statistics survive a soft teardown.
    pub fn unsubscribe(
        &self,
        category: StreamCategory,
        transport: &dyn TelemetryTransport,
    ) -> Result<(), FleetError> {
        let ids = match self.state().categories.get_mut(&category) {
            Some(c) => std::mem::take(&mut c.subscriptions),
            None => return Ok(()),
        };
        let mut first_err = None;
        for id in ids {
            if let Err(e) = transport.unsubscribe(id) {
                warn!(%category, error = %e, "unsubscribe failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every category, attempting all of them even if one fails.
    pub fn unsubscribe_all(&self, transport: &dyn TelemetryTransport) -> Result<(), FleetError> {
        let mut first_err = None;
        for category in StreamCategory::ALL {
            if let Err(e) = self.unsubscribe(category, transport) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_subscribed(&self, category: StreamCategory) -> bool {
        self.state()
            .categories
            .get(&category)
            .is_some_and(|c| !c.subscriptions.is_empty())
    }

    // ── Message path ─────────────────────────────────────────────────────────

    /// Entry point for every decoded message.
    pub fn on_message(&self, msg: TelemetryMessage) {
        let category = msg.category();
        let key = coalescing_key(&msg);
        let now = Instant::now();
        let mut state = self.state();
        let entry = match state.category(category) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%category, error = %e, "dropping message");
                return;
            }
        };
        entry.received += 1;

        if category == StreamCategory::NavGraph {
            entry.retain(key, msg.clone());
            self.process(category, entry, vec![msg]);
            return;
        }

        entry.retain(key, msg);
        if entry.policy.is_due(now) {
            let batch = entry.take_pending();
            entry.policy.mark_processed(now);
            self.process(category, entry, batch);
        } else if !self.quiet() {
            debug!(
                %category,
                pending = entry.pending.len(),
                due_in_ms = entry.policy.remaining(now).as_millis() as u64,
                "coalescing"
            );
        }
    }

    /// Process every category whose window has elapsed.  Called by the
    /// flush timer so the last message of a burst is not left waiting for
    /// another arrival.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let mut handled = 0;
        for (&category, entry) in state.categories.iter_mut() {
            if entry.pending.is_empty() || !entry.policy.is_due(now) {
                continue;
            }
            let batch = entry.take_pending();
            entry.policy.mark_processed(now);
            if category == StreamCategory::NavGraph {
                handled += self.reprocess(entry, batch);
            } else {
                handled += batch.len();
                self.process(category, entry, batch);
            }
        }
        handled
    }

    /// Apply `category`'s pending messages now, ignoring the throttle.
    pub fn force_process_latest(&self, category: StreamCategory) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let Some(entry) = state.categories.get_mut(&category) else {
            return 0;
        };
        let batch = entry.take_pending();
        entry.policy.mark_processed(now);
        let n = batch.len();
        if category == StreamCategory::NavGraph {
            self.reprocess(entry, batch);
        } else {
            self.process(category, entry, batch);
        }
        n
    }

    pub fn force_process_all(&self) -> usize {
        StreamCategory::ALL
            .into_iter()
            .map(|c| self.force_process_latest(c))
            .sum()
    }

    /// Change a category's interval at runtime.
    pub fn set_throttle_interval(
        &self,
        category: StreamCategory,
        interval_ms: u64,
    ) -> Result<(), FleetError> {
        let interval = Duration::from_millis(interval_ms);
        let mut state = self.state();
        if let Some(entry) = state.categories.get_mut(&category) {
            entry.policy.set_interval(interval)?;
        } else if interval.is_zero() {
            return Err(FleetError::InvalidConfig(
                "throttle interval must be greater than zero".to_string(),
            ));
        }
        state.intervals.insert(category, interval);
        info!(%category, interval_ms, "throttle interval updated");
        Ok(())
    }

    pub fn message_stats(&self) -> BTreeMap<StreamCategory, MessageStats> {
        let now = Instant::now();
        let state = self.state();
        StreamCategory::ALL
            .into_iter()
            .map(|category| {
                let stats = match state.categories.get(&category) {
                    Some(c) => MessageStats {
                        received: c.received,
                        processed: c.processed,
                        skipped: c.received.saturating_sub(c.processed),
                        failed: c.failed,
                        interval_ms: c.policy.interval().as_millis() as u64,
                        due_in_ms: c.policy.remaining(now).as_millis() as u64,
                        last_processed: c.last_processed,
                    },
                    None => MessageStats {
                        received: 0,
                        processed: 0,
                        skipped: 0,
                        failed: 0,
                        interval_ms: state.interval(category).as_millis() as u64,
                        due_in_ms: 0,
                        last_processed: None,
                    },
                };
                (category, stats)
            })
            .collect()
    }

    /// Drop pending messages and counters.  Used by full teardown.
    pub fn reset(&self) {
        let mut state = self.state();
        let categories = std::mem::take(&mut state.categories);
        for (category, entry) in categories {
            if !entry.subscriptions.is_empty() {
                warn!(%category, "resetting category with live subscriptions");
            }
        }
    }

    fn process(
        &self,
        category: StreamCategory,
        entry: &mut CategoryState,
        batch: Vec<TelemetryMessage>,
    ) {
        for msg in batch {
            entry.processed += 1;
            match self.transformer.apply(&msg) {
                Ok(update) => {
                    if !self.quiet() {
                        debug!(%category, key = %update.key, changed = update.changed, "processed");
                    }
                }
                Err(e) => {
                    entry.failed += 1;
                    warn!(%category, error = %e, "dropping malformed message");
                }
            }
        }
        entry.last_processed = Some(Utc::now());
    }

    /// Secondary pass for graphs already applied on arrival.  Does not
    /// count towards `processed`.
    fn reprocess(&self, entry: &mut CategoryState, batch: Vec<TelemetryMessage>) -> usize {
        let n = batch.len();
        for msg in batch {
            if let Err(e) = self.transformer.apply(&msg) {
                warn!(error = %e, "nav graph reprocess failed");
            }
        }
        if n > 0 {
            entry.last_processed = Some(Utc::now());
        }
        n
    }

    // ── Flush timer ──────────────────────────────────────────────────────────

    /// Start the periodic flush task.  Replaces a running one.
    pub fn start_flush_task(self: &Arc<Self>, tick: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.flush_due();
            }
        });
        let previous = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Returns `true` if a task was running.
    pub fn stop_flush_task(&self) -> bool {
        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for IngestionManager {
    fn drop(&mut self) {
        self.stop_flush_task();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_context::ContextStore;
    use fleetsync_middleware::SimTransport;
    use fleetsync_types::DoorMode;
    use fleetsync_types::message::{RawDoorState, RawDynamicEventBegin, RawDynamicEventStatus, RawNavGraph};

    fn manager() -> (Arc<IngestionManager>, Arc<ContextStore>) {
        let store = Arc::new(ContextStore::new());
        let transformer = Arc::new(StateTransformer::new(Arc::clone(&store)));
        (Arc::new(IngestionManager::new(transformer)), store)
    }

    fn door(name: &str, mode: u32) -> TelemetryMessage {
        TelemetryMessage::DoorState(RawDoorState {
            door_name: Some(name.into()),
            current_mode: Some(mode),
        })
    }

    async fn subscribed(sim: &SimTransport, m: &Arc<IngestionManager>, category: StreamCategory) {
        if !sim.is_connected() {
            sim.connect(0).await.unwrap();
        }
        m.subscribe(category, sim).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_to_last_message() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;

        for mode in [0, 1, 0, 1, 2] {
            sim.emit("door_states", door("main", mode));
        }
        assert!(store.doors().is_empty(), "nothing applied inside the window");

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(m.flush_due(), 1);

        let stats = &m.message_stats()[&StreamCategory::DoorState];
        assert_eq!(stats.received, 5);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 4);
        assert_eq!(store.doors()[0].mode, DoorMode::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_time_until_window_reopens() {
        let (m, _) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(m.message_stats()[&StreamCategory::DoorState].due_in_ms, 300);
        assert_eq!(m.message_stats()[&StreamCategory::LiftState].due_in_ms, 0);

        tokio::time::advance(Duration::from_millis(301)).await;
        sim.emit("door_states", door("main", 2));
        assert_eq!(m.message_stats()[&StreamCategory::DoorState].due_in_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn due_arrival_is_processed_immediately() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        sim.emit("door_states", door("main", 2));
        assert_eq!(store.doors().len(), 1);

        sim.emit("door_states", door("main", 0));
        assert_eq!(store.doors()[0].mode, DoorMode::Open, "second arrival waits");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_are_all_kept() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;

        sim.emit("door_states", door("a", 0));
        sim.emit("door_states", door("b", 0));
        sim.emit("door_states", door("a", 2));
        assert_eq!(m.force_process_latest(StreamCategory::DoorState), 2);

        let names: Vec<String> = store.doors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn nav_graph_applies_on_arrival() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::NavGraph).await;

        sim.emit(
            "nav_graphs",
            TelemetryMessage::NavGraph(RawNavGraph { name: Some("fleet1".into()), ..Default::default() }),
        );
        assert!(store.nav_graph("fleet1").is_some());
        let stats = &m.message_stats()[&StreamCategory::NavGraph];
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.interval_ms, 5000);

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(m.flush_due(), 1, "secondary reprocess pass");
        assert_eq!(m.message_stats()[&StreamCategory::NavGraph].processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_message_does_not_block_the_next() {
        let (m, store) = manager();
        m.on_message(TelemetryMessage::DoorState(RawDoorState::default()));
        m.on_message(door("ok", 0));
        m.force_process_all();

        let stats = &m.message_stats()[&StreamCategory::DoorState];
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 2);
        assert_eq!(store.doors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn begin_and_status_do_not_supersede_each_other() {
        let (m, store) = manager();
        m.on_message(TelemetryMessage::DynamicEventBegin(RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(2),
            description: None,
        }));
        m.on_message(TelemetryMessage::DynamicEventStatus(RawDynamicEventStatus {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(2),
            status: Some("underway".into()),
        }));
        m.force_process_latest(StreamCategory::DynamicEvent);

        let session = store.get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.status, fleetsync_types::DynamicEventStatus::Underway);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unsubscribe_releases() {
        let (m, _) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DynamicEvent).await;
        m.subscribe(StreamCategory::DynamicEvent, &sim).unwrap();
        assert_eq!(sim.subscription_count(), 2);
        assert!(m.is_subscribed(StreamCategory::DynamicEvent));

        m.unsubscribe_all(&sim).unwrap();
        assert_eq!(sim.subscription_count(), 0);
        assert!(!m.is_subscribed(StreamCategory::DynamicEvent));
    }

    #[tokio::test]
    async fn failed_subscription_rolls_back_sibling_topics() {
        let (m, _) = manager();
        let sim = SimTransport::new();
        sim.connect(0).await.unwrap();
        sim.fail_subscribe(Some("dynamic_event_status"));

        assert!(m.subscribe(StreamCategory::DynamicEvent, &sim).is_err());
        assert_eq!(sim.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_throttle_interval_takes_effect() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;
        assert!(m.set_throttle_interval(StreamCategory::DoorState, 0).is_err());
        m.set_throttle_interval(StreamCategory::DoorState, 10).unwrap();

        tokio::time::advance(Duration::from_millis(11)).await;
        sim.emit("door_states", door("main", 2));
        assert_eq!(store.doors().len(), 1);
        assert_eq!(m.message_stats()[&StreamCategory::DoorState].interval_ms, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_task_drains_trailing_messages() {
        let (m, store) = manager();
        let sim = SimTransport::new();
        subscribed(&sim, &m, StreamCategory::DoorState).await;
        m.start_flush_task(Duration::from_millis(50));

        sim.emit("door_states", door("main", 2));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.doors().len(), 1);

        assert!(m.stop_flush_task());
        assert!(!m.stop_flush_task());
    }

    #[test]
    fn from_config_applies_overrides() {
        let store = Arc::new(ContextStore::new());
        let transformer = Arc::new(StateTransformer::new(store));
        let mut config = EngineConfig::default();
        config.throttle.insert("lift_state".into(), 120);
        let m = IngestionManager::from_config(transformer, &config).unwrap();
        assert_eq!(m.message_stats()[&StreamCategory::LiftState].interval_ms, 120);
    }
}
