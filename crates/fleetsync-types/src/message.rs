//! Decoded raw telemetry messages.
//!
//! These mirror what arrives on the middleware bus.  Every field that a
//! publisher may omit is an `Option` (or a defaulted collection) so absence is
//! explicit instead of being inferred from truthiness.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical telemetry feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCategory {
    FleetState,
    DoorState,
    LiftState,
    NavGraph,
    DynamicEvent,
}

impl StreamCategory {
    pub const ALL: [StreamCategory; 5] = [
        StreamCategory::FleetState,
        StreamCategory::DoorState,
        StreamCategory::LiftState,
        StreamCategory::NavGraph,
        StreamCategory::DynamicEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamCategory::FleetState => "fleet_state",
            StreamCategory::DoorState => "door_state",
            StreamCategory::LiftState => "lift_state",
            StreamCategory::NavGraph => "nav_graph",
            StreamCategory::DynamicEvent => "dynamic_event",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == label)
    }
}

impl fmt::Display for StreamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `true` when a caller-supplied identifier carries an actual value.
///
/// Empty strings and the `"all"` / `"auto"` sentinels mean "not specified".
pub fn is_meaningful(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && v != "all" && v != "auto"
}

/// Filter an optional identifier through [`is_meaningful`].
pub fn meaningful(value: Option<&str>) -> Option<&str> {
    value.filter(|v| is_meaningful(v))
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub yaw: Option<f64>,
    #[serde(default)]
    pub level_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawRobotState {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub battery_percent: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location: Option<RawLocation>,
    #[serde(default)]
    pub path: Vec<RawLocation>,
    #[serde(default)]
    pub dynamic_event_seq: Option<u64>,
    #[serde(default)]
    pub dynamic_event_description: Option<String>,
    #[serde(default)]
    pub dynamic_event_start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub dynamic_event_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFleetState {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub robots: Vec<RawRobotState>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDoorState {
    #[serde(default)]
    pub door_name: Option<String>,
    #[serde(default)]
    pub current_mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawLiftState {
    #[serde(default)]
    pub lift_name: Option<String>,
    #[serde(default)]
    pub current_floor: Option<String>,
    #[serde(default)]
    pub destination_floor: Option<String>,
    #[serde(default)]
    pub available_floors: Vec<String>,
    #[serde(default)]
    pub door_state: Option<u32>,
    #[serde(default)]
    pub motion_state: Option<u32>,
    #[serde(default)]
    pub current_mode: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Named parameter attached to a graph vertex (`is_charger`, `is_parking_spot`, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawParam {
    pub name: String,
    #[serde(default)]
    pub value_bool: Option<bool>,
    #[serde(default)]
    pub value_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawVertex {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub params: Vec<RawParam>,
}

impl RawVertex {
    /// `true` when the boolean parameter `name` is present and set.
    pub fn flag(&self, name: &str) -> bool {
        self.params
            .iter()
            .any(|p| p.name == name && p.value_bool.unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEdge {
    pub v1_idx: usize,
    pub v2_idx: usize,
    /// `0` = bidirectional, `1` = one way.
    #[serde(default)]
    pub edge_type: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawZone {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub zone_type: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub center_x: Option<f64>,
    #[serde(default)]
    pub center_y: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub vertices: Vec<(f64, f64)>,
    #[serde(default)]
    pub transition_lanes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawNavGraph {
    /// Reporting source; usually the fleet name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub vertices: Vec<RawVertex>,
    #[serde(default)]
    pub edges: Vec<RawEdge>,
    #[serde(default)]
    pub zones: Vec<RawZone>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDynamicEventBegin {
    #[serde(default)]
    pub robot_name: Option<String>,
    #[serde(default)]
    pub fleet_name: Option<String>,
    #[serde(default)]
    pub dynamic_event_seq: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDynamicEventStatus {
    #[serde(default)]
    pub robot_name: Option<String>,
    #[serde(default)]
    pub fleet_name: Option<String>,
    #[serde(default)]
    pub dynamic_event_seq: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapLevel {
    pub name: String,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default)]
    pub nav_graphs: Vec<RawNavGraph>,
}

/// Building map returned by the on-demand map request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapData {
    pub building_name: String,
    #[serde(default)]
    pub levels: Vec<MapLevel>,
    #[serde(default)]
    pub doors: Vec<String>,
    #[serde(default)]
    pub lifts: Vec<String>,
}

/// One decoded message handed to a subscription handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "msg", rename_all = "snake_case")]
pub enum TelemetryMessage {
    FleetState(RawFleetState),
    DoorState(RawDoorState),
    LiftState(RawLiftState),
    NavGraph(RawNavGraph),
    DynamicEventBegin(RawDynamicEventBegin),
    DynamicEventStatus(RawDynamicEventStatus),
}

impl TelemetryMessage {
    pub fn category(&self) -> StreamCategory {
        match self {
            TelemetryMessage::FleetState(_) => StreamCategory::FleetState,
            TelemetryMessage::DoorState(_) => StreamCategory::DoorState,
            TelemetryMessage::LiftState(_) => StreamCategory::LiftState,
            TelemetryMessage::NavGraph(_) => StreamCategory::NavGraph,
            TelemetryMessage::DynamicEventBegin(_) | TelemetryMessage::DynamicEventStatus(_) => {
                StreamCategory::DynamicEvent
            }
        }
    }

    /// Coalescing key within the message's category.  Missing names map to
    /// the empty key so the message is still counted and coalesced.
    pub fn key(&self) -> String {
        fn or_empty(v: &Option<String>) -> String {
            v.clone().unwrap_or_default()
        }
        match self {
            TelemetryMessage::FleetState(m) => or_empty(&m.name),
            TelemetryMessage::DoorState(m) => or_empty(&m.door_name),
            TelemetryMessage::LiftState(m) => or_empty(&m.lift_name),
            TelemetryMessage::NavGraph(m) => or_empty(&m.name),
            TelemetryMessage::DynamicEventBegin(m) => {
                format!("{}/{}", or_empty(&m.fleet_name), or_empty(&m.robot_name))
            }
            TelemetryMessage::DynamicEventStatus(m) => {
                format!("{}/{}", or_empty(&m.fleet_name), or_empty(&m.robot_name))
            }
        }
    }
}
