//! External service seams.
//!
//! The engine never speaks a wire protocol itself.  Every outside
//! collaborator is reached through one of the traits below; production
//! bindings implement them over the real middleware, tests use
//! [`SimTransport`][crate::sim::SimTransport].
//!
//! - [`TelemetryTransport`] – connect to the bus and subscribe to topics.
//! - [`MapDataSource`] – the one idempotent on-demand request.
//! - [`GoalTransport`] – submit an action goal and receive its feedback
//!   stream plus terminal result.
//! - [`OutwardSocket`] – optional socket towards an external dashboard.

use std::sync::Arc;

use async_trait::async_trait;
use fleetsync_types::{FleetError, GoalFeedback, GoalRequest, GoalResult, MapData, TelemetryMessage};
use tokio::sync::{mpsc, oneshot};

/// Callback invoked once per decoded message on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(TelemetryMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Volatile,
    TransientLocal,
}

/// Quality-of-service category requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosHint {
    pub reliability: Reliability,
    pub durability: Durability,
    pub depth: usize,
}

impl QosHint {
    /// Periodic state streams: only the newest sample matters.
    pub fn telemetry() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            depth: 10,
        }
    }

    /// Latched data such as navigation graphs: late joiners need the last
    /// published value.
    pub fn latched() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::TransientLocal,
            depth: 1,
        }
    }

    /// Event notifications that must not be dropped.
    pub fn reliable() -> Self {
        Self {
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            depth: 100,
        }
    }
}

/// Opaque handle returned by [`TelemetryTransport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Join the bus partition identified by `domain_id`.
    async fn connect(&self, domain_id: u32) -> Result<(), FleetError>;

    /// Register `handler` for every message on `topic`.
    fn subscribe(
        &self,
        topic: &str,
        qos: QosHint,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, FleetError>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), FleetError>;

    /// Release the bus connection and every low-level resource behind it.
    async fn disconnect(&self) -> Result<(), FleetError>;
}

#[async_trait]
pub trait MapDataSource: Send + Sync {
    /// Fetch the building map.  `Ok(None)` means the service answered but
    /// has no map loaded.
    async fn fetch_map_data(&self) -> Result<Option<MapData>, FleetError>;
}

/// Live correlation channels for one submitted goal.
///
/// `feedback` yields zero or more intermediate reports; `result` resolves
/// once with the terminal outcome.  A dropped `result` sender means the
/// transport lost the goal.
pub struct GoalHandle {
    pub feedback: mpsc::Receiver<GoalFeedback>,
    pub result: oneshot::Receiver<GoalResult>,
}

#[async_trait]
pub trait GoalTransport: Send + Sync {
    /// Submit `goal`.  An `Err` means the transport rejected the submission
    /// outright (not ready, network failure).
    async fn submit_goal(&self, goal: GoalRequest) -> Result<GoalHandle, FleetError>;
}

/// Where the outward socket connects to.
#[derive(Clone, PartialEq, Eq)]
pub struct SocketTarget {
    pub host: String,
    pub port: u16,
    pub jwt: Option<String>,
}

impl SocketTarget {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for SocketTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("jwt", if self.jwt.is_some() { &"<redacted>" } else { &"<not set>" })
            .finish()
    }
}

#[async_trait]
pub trait OutwardSocket: Send + Sync {
    async fn connect(&self, target: &SocketTarget) -> Result<(), FleetError>;

    /// Queue one text frame for delivery.
    async fn send(&self, frame: String) -> Result<(), FleetError>;

    async fn disconnect(&self) -> Result<(), FleetError>;

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_target_url_and_redaction() {
        let target = SocketTarget {
            host: "dashboard.local".into(),
            port: 8000,
            jwt: Some("secret-token".into()),
        };
        assert_eq!(target.url(), "ws://dashboard.local:8000");
        let dbg = format!("{target:?}");
        assert!(!dbg.contains("secret-token"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn qos_presets_differ() {
        assert_eq!(QosHint::latched().durability, Durability::TransientLocal);
        assert_eq!(QosHint::telemetry().reliability, Reliability::BestEffort);
        assert_eq!(QosHint::reliable().reliability, Reliability::Reliable);
    }
}
