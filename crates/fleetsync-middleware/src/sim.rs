//! In-process simulated transport.
//!
//! [`SimTransport`] implements every consumed interface
//! ([`TelemetryTransport`], [`MapDataSource`], [`GoalTransport`]) without a
//! real middleware behind it:
//!
//! * **Telemetry** – handlers registered through `subscribe` are invoked
//!   synchronously by [`SimTransport::emit`].
//! * **Map data** – returns a configurable [`MapData`] (or error) after an
//!   optional delay and counts every real fetch.
//! * **Goals** – replays a scripted [`GoalScript`]: a list of feedback
//!   reports followed by an optional terminal result.
//!
//! Failure injection (`fail_connect_with`, `fail_subscribe`,
//! `fail_disconnect_with`) lets callers drive orchestration rollback paths;
//! `set_connect_delay` keeps a connection attempt pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleetsync_types::{FleetError, GoalFeedback, GoalRequest, GoalResult, MapData, TelemetryMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::adapter::{
    GoalHandle, GoalTransport, MapDataSource, MessageHandler, QosHint, SubscriptionId,
    TelemetryTransport,
};

/// Scripted behaviour for the next submitted goals.
#[derive(Debug, Clone, Default)]
pub struct GoalScript {
    pub feedback: Vec<GoalFeedback>,
    /// `None` leaves the goal in flight forever.
    pub result: Option<GoalResult>,
    /// When set, `submit_goal` fails immediately with this error.
    pub reject: Option<FleetError>,
}

struct Subscription {
    topic: String,
    qos: QosHint,
    handler: MessageHandler,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    next_id: u64,
    subscriptions: HashMap<u64, Subscription>,
    fail_connect: Option<FleetError>,
    connect_delay: Option<Duration>,
    fail_disconnect: Option<FleetError>,
    fail_subscribe: Option<String>,
    map_data: Option<MapData>,
    map_error: Option<FleetError>,
    map_delay: Option<Duration>,
    goal_script: GoalScript,
    submitted: Vec<GoalRequest>,
    parked_results: Vec<oneshot::Sender<GoalResult>>,
}

/// Simulated middleware for tests and the demo binary.
#[derive(Default)]
pub struct SimTransport {
    state: Mutex<SimState>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    map_fetches: AtomicUsize,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `msg` to every handler subscribed to `topic`.  Returns the
    /// number of handlers invoked.
    pub fn emit(&self, topic: &str, msg: TelemetryMessage) -> usize {
        // Handlers run outside the lock so they may call back into the sim.
        let handlers: Vec<MessageHandler> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.topic == topic)
            .map(|s| s.handler.clone())
            .collect();
        for handler in &handlers {
            handler(msg.clone());
        }
        handlers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    /// Topics with at least one live subscription, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .state()
            .subscriptions
            .values()
            .map(|s| s.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn qos_for(&self, topic: &str) -> Option<QosHint> {
        self.state()
            .subscriptions
            .values()
            .find(|s| s.topic == topic)
            .map(|s| s.qos)
    }

    /// Make `connect` take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    pub fn fail_connect_with(&self, err: Option<FleetError>) {
        self.state().fail_connect = err;
    }

    pub fn fail_disconnect_with(&self, err: Option<FleetError>) {
        self.state().fail_disconnect = err;
    }

    /// Make `subscribe` fail for `topic` (or stop failing with `None`).
    pub fn fail_subscribe(&self, topic: Option<&str>) {
        self.state().fail_subscribe = topic.map(str::to_string);
    }

    pub fn set_map_data(&self, map: Option<MapData>) {
        self.state().map_data = map;
    }

    pub fn set_map_error(&self, err: Option<FleetError>) {
        self.state().map_error = err;
    }

    pub fn set_map_delay(&self, delay: Option<Duration>) {
        self.state().map_delay = delay;
    }

    pub fn map_fetch_count(&self) -> usize {
        self.map_fetches.load(Ordering::SeqCst)
    }

    pub fn set_goal_script(&self, script: GoalScript) {
        self.state().goal_script = script;
    }

    pub fn submitted_goals(&self) -> Vec<GoalRequest> {
        self.state().submitted.clone()
    }
}

#[async_trait]
impl TelemetryTransport for SimTransport {
    async fn connect(&self, domain_id: u32) -> Result<(), FleetError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(err) = state.fail_connect.clone() {
            return Err(err);
        }
        state.connected = true;
        debug!(domain_id, "sim transport connected");
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        qos: QosHint,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, FleetError> {
        let mut state = self.state();
        if !state.connected {
            return Err(FleetError::Unavailable(format!(
                "cannot subscribe to {topic}: transport not connected"
            )));
        }
        if state.fail_subscribe.as_deref() == Some(topic) {
            return Err(FleetError::Connection(format!("subscription to {topic} refused")));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.insert(
            id,
            Subscription {
                topic: topic.to_string(),
                qos,
                handler,
            },
        );
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), FleetError> {
        self.state().subscriptions.remove(&id.0);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), FleetError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(err) = state.fail_disconnect.clone() {
            return Err(err);
        }
        state.connected = false;
        state.subscriptions.clear();
        state.parked_results.clear();
        Ok(())
    }
}

#[async_trait]
impl MapDataSource for SimTransport {
    async fn fetch_map_data(&self) -> Result<Option<MapData>, FleetError> {
        self.map_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().map_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        match &state.map_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.map_data.clone()),
        }
    }
}

#[async_trait]
impl GoalTransport for SimTransport {
    async fn submit_goal(&self, goal: GoalRequest) -> Result<GoalHandle, FleetError> {
        let mut state = self.state();
        if !state.connected {
            return Err(FleetError::Unavailable("goal transport not ready".to_string()));
        }
        let script = state.goal_script.clone();
        if let Some(err) = script.reject {
            return Err(err);
        }
        state.submitted.push(goal);

        let (feedback_tx, feedback_rx) = mpsc::channel(script.feedback.len().max(1));
        for fb in script.feedback {
            // Capacity covers the whole script, so this cannot fail.
            let _ = feedback_tx.try_send(fb);
        }
        let (result_tx, result_rx) = oneshot::channel();
        match script.result {
            Some(result) => {
                let _ = result_tx.send(result);
            }
            None => state.parked_results.push(result_tx),
        }

        Ok(GoalHandle {
            feedback: feedback_rx,
            result: result_rx,
        })
    }
}
