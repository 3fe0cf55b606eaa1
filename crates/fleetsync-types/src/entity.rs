//! Canonical entities held by the context store.
//!
//! Every entity here is the *reconciled* form of one or more raw telemetry
//! messages.  Raw wire shapes live in [`crate::message`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two reports closer than this on both axes describe the same place.
///
/// This is a heuristic: it assumes every fleet reports coordinates in the
/// same frame with sub-centimetre agreement.
pub const POSITION_TOLERANCE: f64 = 0.01;

/// A planar point in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// `true` when `other` lies within [`POSITION_TOLERANCE`] on both axes.
    pub fn approx_eq(&self, other: &Point2) -> bool {
        (self.x - other.x).abs() < POSITION_TOLERANCE
            && (self.y - other.y).abs() < POSITION_TOLERANCE
    }
}

/// Where a robot currently is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RobotLocation {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub level_name: String,
}

/// Operating mode reported by a fleet adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    #[default]
    Idle,
    Charging,
    Moving,
    Paused,
    Waiting,
    Emergency,
    GoingHome,
    Docking,
    AdapterError,
    Cleaning,
    Unknown,
}

impl RobotMode {
    /// Map the numeric mode code used on the bus to a [`RobotMode`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => RobotMode::Idle,
            1 => RobotMode::Charging,
            2 => RobotMode::Moving,
            3 => RobotMode::Paused,
            4 => RobotMode::Waiting,
            5 => RobotMode::Emergency,
            6 => RobotMode::GoingHome,
            7 => RobotMode::Docking,
            8 => RobotMode::AdapterError,
            9 => RobotMode::Cleaning,
            _ => RobotMode::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RobotMode::Idle => "idle",
            RobotMode::Charging => "charging",
            RobotMode::Moving => "moving",
            RobotMode::Paused => "paused",
            RobotMode::Waiting => "waiting",
            RobotMode::Emergency => "emergency",
            RobotMode::GoingHome => "going_home",
            RobotMode::Docking => "docking",
            RobotMode::AdapterError => "adapter_error",
            RobotMode::Cleaning => "cleaning",
            RobotMode::Unknown => "unknown",
        }
    }
}

/// Lifecycle of a dynamic event session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicEventStatus {
    Active,
    Standby,
    Underway,
    Completed,
    Failed,
    Canceled,
}

impl DynamicEventStatus {
    /// Parse a status label as reported on the bus.  Unknown labels yield
    /// `None` so the caller can decide how to log them.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "standby" => Some(Self::Standby),
            "underway" => Some(Self::Underway),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Correlates a dispatched goal's sequence number with one robot's
/// in-progress task segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicEventSession {
    pub seq: u64,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub status: DynamicEventStatus,
}

/// One mobile unit, keyed by `(name, fleet)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robot {
    pub name: String,
    pub fleet: String,
    pub model: String,
    pub mode: RobotMode,
    pub task_id: String,
    pub location: RobotLocation,
    /// State of charge in `[0, 100]`.
    pub battery_percent: f64,
    pub status: String,
    pub path: Vec<RobotLocation>,
    pub dynamic_event: Option<DynamicEventSession>,
    pub updated_at: DateTime<Utc>,
}

impl Robot {
    /// Minimal placeholder entry for a robot the fleet has not reported yet.
    pub fn placeholder(name: impl Into<String>, fleet: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fleet: fleet.into(),
            model: String::new(),
            mode: RobotMode::Unknown,
            task_id: String::new(),
            location: RobotLocation::default(),
            battery_percent: 0.0,
            status: "unknown".to_string(),
            path: Vec::new(),
            dynamic_event: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is(&self, name: &str, fleet: &str) -> bool {
        self.name == name && self.fleet == fleet
    }
}

/// Most recent raw snapshot reported by one fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub name: String,
    pub snapshot: crate::message::RawFleetState,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorMode {
    Closed,
    Moving,
    Open,
    #[default]
    Unknown,
}

impl DoorMode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => DoorMode::Closed,
            1 => DoorMode::Moving,
            2 => DoorMode::Open,
            _ => DoorMode::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Door {
    pub name: String,
    pub mode: DoorMode,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lift {
    pub name: String,
    pub current_floor: String,
    pub destination_floor: String,
    pub available_floors: Vec<String>,
    pub door_mode: DoorMode,
    pub motion_state: u32,
    pub current_mode: u32,
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
}

/// A spatial region, possibly reported by several fleets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub zone_type: String,
    pub level: String,
    pub center: Point2,
    pub width: f64,
    pub height: f64,
    pub vertices: Vec<Point2>,
    pub transition_lanes: Vec<String>,
    pub fleets: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Charger,
    Parking,
    Holding,
    #[default]
    Waypoint,
}

impl LocationKind {
    /// Charger wins over parking, which wins over holding.
    pub fn from_flags(is_charger: bool, is_parking: bool, is_holding: bool) -> Self {
        if is_charger {
            LocationKind::Charger
        } else if is_parking {
            LocationKind::Parking
        } else if is_holding {
            LocationKind::Holding
        } else {
            LocationKind::Waypoint
        }
    }
}

/// A named waypoint, possibly reported by several fleets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub position: Point2,
    pub level: String,
    pub is_charger: bool,
    pub is_parking: bool,
    pub is_holding: bool,
    pub kind: LocationKind,
    pub fleets: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphVertex {
    pub name: String,
    pub position: Point2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: usize,
    pub to: usize,
    pub bidirectional: bool,
}

/// Per-source navigation graph, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavGraph {
    pub source: String,
    pub level: String,
    pub vertices: Vec<GraphVertex>,
    pub edges: Vec<GraphEdge>,
    pub zones: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_eq_respects_tolerance() {
        let a = Point2::new(1.0, 1.0);
        assert!(a.approx_eq(&Point2::new(1.005, 0.996)));
        assert!(!a.approx_eq(&Point2::new(1.02, 1.0)));
        assert!(!a.approx_eq(&Point2::new(1.0, 0.98)));
    }

    #[test]
    fn location_kind_priority() {
        assert_eq!(LocationKind::from_flags(true, true, true), LocationKind::Charger);
        assert_eq!(LocationKind::from_flags(false, true, true), LocationKind::Parking);
        assert_eq!(LocationKind::from_flags(false, false, true), LocationKind::Holding);
        assert_eq!(LocationKind::from_flags(false, false, false), LocationKind::Waypoint);
    }

    #[test]
    fn robot_mode_codes() {
        assert_eq!(RobotMode::from_code(2), RobotMode::Moving);
        assert_eq!(RobotMode::from_code(42), RobotMode::Unknown);
        assert_eq!(RobotMode::Moving.as_str(), "moving");
    }

    #[test]
    fn dynamic_event_status_parsing() {
        assert_eq!(DynamicEventStatus::parse("Cancelled"), Some(DynamicEventStatus::Canceled));
        assert_eq!(DynamicEventStatus::parse(" underway "), Some(DynamicEventStatus::Underway));
        assert!(DynamicEventStatus::parse("exploded").is_none());
        assert!(DynamicEventStatus::Failed.is_terminal());
        assert!(!DynamicEventStatus::Active.is_terminal());
    }
}
