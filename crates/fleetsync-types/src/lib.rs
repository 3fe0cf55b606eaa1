//! `fleetsync-types` – shared vocabulary of the telemetry engine.
//!
//! - [`entity`] – canonical, reconciled entities owned by the context store.
//! - [`message`] – decoded raw telemetry messages as they arrive on the bus.
//! - [`goal`] – action-goal payloads and the `[success, failure, status]`
//!   output contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod entity;
pub mod goal;
pub mod message;

pub use entity::{
    Door, DoorMode, DynamicEventSession, DynamicEventStatus, Fleet, GraphEdge, GraphVertex, Lift,
    Location, LocationKind, NavGraph, Point2, Robot, RobotLocation, RobotMode, Zone,
    POSITION_TOLERANCE,
};
pub use goal::{GoalFeedback, GoalOutput, GoalRequest, GoalResult};
pub use message::{MapData, StreamCategory, TelemetryMessage};

/// Outward lifecycle notifications consumed by status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Ready,
    SocketConnected,
    SocketDisconnected,
    #[serde(rename = "cleanedUp")]
    CleanedUp,
    Error(String),
}

impl LifecycleEvent {
    /// Stable event name as seen by external consumers.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Ready => "ready",
            LifecycleEvent::SocketConnected => "socket_connected",
            LifecycleEvent::SocketDisconnected => "socket_disconnected",
            LifecycleEvent::CleanedUp => "cleanedUp",
            LifecycleEvent::Error(_) => "error",
        }
    }
}

/// Unified event wrapper for the notification bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"fleetsync-runtime::lifecycle"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Lifecycle(LifecycleEvent),
    /// One processed message changed the canonical context.
    ContextUpdated { category: StreamCategory, key: String },
}

/// Error taxonomy spanning transport availability, malformed telemetry,
/// orchestration and goal dispatch.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetError {
    /// A dependency (bus, transport) is not ready yet.  Retrying later may
    /// succeed.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// The bus is reachable but the handshake or authentication failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Malformed {category} message: {details}")]
    Malformed { category: StreamCategory, details: String },

    #[error("Initialization failed at {step}: {details}")]
    Initialization { step: String, details: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Notification channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FleetError {
    pub fn malformed(category: StreamCategory, details: impl Into<String>) -> Self {
        FleetError::Malformed { category, details: details.into() }
    }

    /// `true` for errors a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_event_names() {
        assert_eq!(LifecycleEvent::Ready.name(), "ready");
        assert_eq!(LifecycleEvent::CleanedUp.name(), "cleanedUp");
        assert_eq!(LifecycleEvent::Error("boom".into()).name(), "error");
    }

    #[test]
    fn cleaned_up_serializes_with_external_name() {
        let json = serde_json::to_string(&LifecycleEvent::CleanedUp).unwrap();
        assert!(json.contains("cleanedUp"));
    }

    #[test]
    fn fleet_error_display() {
        let err = FleetError::malformed(StreamCategory::DoorState, "missing door_name");
        assert!(err.to_string().contains("door_state"));
        assert!(err.to_string().contains("missing door_name"));

        assert!(FleetError::Unavailable("bus".into()).is_transient());
        assert!(!FleetError::Connection("bad jwt".into()).is_transient());
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "fleetsync-runtime::ingestion",
            EventPayload::ContextUpdated {
                category: StreamCategory::FleetState,
                key: "fleetA".to_string(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(event.source, back.source);
    }
}
