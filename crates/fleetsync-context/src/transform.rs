//! State Transformer: raw telemetry → canonical context.
//!
//! One `apply_*` function per telemetry category.  Each performs its whole
//! mutation inside a single [`ContextStore::update`] call and then notifies
//! every registered observer exactly once, regardless of how many entities
//! the message touched.  Missing optional fields never fail a transform;
//! only a missing *identity* (fleet, door or lift name, event correlation
//! ids) makes the message [`FleetError::Malformed`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use fleetsync_types::message::{
    RawDoorState, RawDynamicEventBegin, RawDynamicEventStatus, RawFleetState, RawLiftState,
    RawLocation, RawNavGraph, RawRobotState, RawZone,
};
use fleetsync_types::{
    Door, DoorMode, DynamicEventSession, DynamicEventStatus, FleetError, GraphEdge, GraphVertex,
    Lift, Location, LocationKind, MapData, NavGraph, Point2, Robot, RobotLocation, RobotMode,
    StreamCategory, TelemetryMessage, Zone,
};
use tracing::{debug, warn};

use crate::store::{ContextState, ContextStore, MergeOutcome, RobotReport, SessionReport};

/// Source name used for building-map graphs that do not name themselves.
pub const BUILDING_MAP_SOURCE: &str = "building_map";

/// Source name for fleet-reported graphs without a name.
pub const UNNAMED_SOURCE: &str = "unnamed";

/// Summary of one applied message, handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextUpdate {
    pub category: StreamCategory,
    /// Fleet, door, lift or graph name; `fleet/robot` for dynamic events.
    pub key: String,
    /// Number of entities written.
    pub changed: usize,
}

pub type UpdateObserver = Arc<dyn Fn(&ContextUpdate) + Send + Sync>;

/// Handle returned by [`StateTransformer::register_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct StateTransformer {
    store: Arc<ContextStore>,
    observers: RwLock<Vec<(ObserverId, UpdateObserver)>>,
    next_observer: AtomicU64,
}

impl StateTransformer {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self {
            store,
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub fn register_observer(&self, observer: UpdateObserver) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Route `msg` to the transformer for its category.
    pub fn apply(&self, msg: &TelemetryMessage) -> Result<ContextUpdate, FleetError> {
        match msg {
            TelemetryMessage::FleetState(m) => self.apply_fleet_state(m),
            TelemetryMessage::DoorState(m) => self.apply_door_state(m),
            TelemetryMessage::LiftState(m) => self.apply_lift_state(m),
            TelemetryMessage::NavGraph(m) => self.apply_nav_graph(m),
            TelemetryMessage::DynamicEventBegin(m) => self.apply_dynamic_event_begin(m),
            TelemetryMessage::DynamicEventStatus(m) => self.apply_dynamic_event_status(m),
        }
    }

    /// Replace the reporting fleet's robots.  Robots without a name are
    /// skipped; active sessions survive snapshots that omit them.
    pub fn apply_fleet_state(&self, msg: &RawFleetState) -> Result<ContextUpdate, FleetError> {
        let fleet = required(&msg.name, StreamCategory::FleetState, "fleet name")?;

        let robots: Vec<RobotReport> = msg
            .robots
            .iter()
            .filter_map(|raw| match raw.name.as_deref().filter(|n| !n.is_empty()) {
                Some(name) => Some(robot_from_raw(name, &fleet, raw)),
                None => {
                    warn!(fleet = %fleet, "skipping robot state without a name");
                    None
                }
            })
            .collect();
        let changed = robots.len();

        self.store.update(|s| {
            s.replace_fleet_robots(&fleet, robots);
            s.record_fleet_snapshot(&fleet, msg.clone());
            s.touch(StreamCategory::FleetState);
        });

        Ok(self.notify(StreamCategory::FleetState, fleet, changed))
    }

    pub fn apply_door_state(&self, msg: &RawDoorState) -> Result<ContextUpdate, FleetError> {
        let name = required(&msg.door_name, StreamCategory::DoorState, "door_name")?;
        let door = Door {
            name: name.clone(),
            mode: msg.current_mode.map(DoorMode::from_code).unwrap_or_default(),
            updated_at: Utc::now(),
        };
        self.store.update(|s| {
            s.upsert_door(door);
            s.touch(StreamCategory::DoorState);
        });
        Ok(self.notify(StreamCategory::DoorState, name, 1))
    }

    pub fn apply_lift_state(&self, msg: &RawLiftState) -> Result<ContextUpdate, FleetError> {
        let name = required(&msg.lift_name, StreamCategory::LiftState, "lift_name")?;
        let lift = Lift {
            name: name.clone(),
            current_floor: msg.current_floor.clone().unwrap_or_default(),
            destination_floor: msg.destination_floor.clone().unwrap_or_default(),
            available_floors: msg.available_floors.clone(),
            door_mode: msg.door_state.map(DoorMode::from_code).unwrap_or_default(),
            motion_state: msg.motion_state.unwrap_or_default(),
            current_mode: msg.current_mode.unwrap_or_default(),
            session_id: msg.session_id.clone().unwrap_or_default(),
            updated_at: Utc::now(),
        };
        self.store.update(|s| {
            s.upsert_lift(lift);
            s.touch(StreamCategory::LiftState);
        });
        Ok(self.notify(StreamCategory::LiftState, name, 1))
    }

    /// Store the graph under its source name and merge its named vertices
    /// and zones into the shared location/zone collections.
    pub fn apply_nav_graph(&self, msg: &RawNavGraph) -> Result<ContextUpdate, FleetError> {
        let source = msg
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNNAMED_SOURCE.to_string());
        let level = msg.level.clone().unwrap_or_default();

        let changed = self.store.update(|s| {
            let changed = merge_graph(s, &source, &level, msg);
            s.touch(StreamCategory::NavGraph);
            changed
        });
        Ok(self.notify(StreamCategory::NavGraph, source, changed))
    }

    /// Feed every graph of a building map through the nav-graph path.
    ///
    /// Applied only if the store is still at `generation`, so a fetch that
    /// outlives a full cleanup cannot repopulate the cleared store.
    pub fn apply_map_data(
        &self,
        map: &MapData,
        generation: u64,
    ) -> Result<Option<ContextUpdate>, FleetError> {
        let applied = self.store.update_if_generation(generation, |s| {
            let mut changed = 0;
            for level in &map.levels {
                for graph in &level.nav_graphs {
                    let source = graph
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| BUILDING_MAP_SOURCE.to_string());
                    let graph_level = graph.level.clone().unwrap_or_else(|| level.name.clone());
                    changed += merge_graph(s, &source, &graph_level, graph);
                }
            }
            s.touch(StreamCategory::NavGraph);
            changed
        });

        match applied {
            Some(changed) => Ok(Some(self.notify(
                StreamCategory::NavGraph,
                map.building_name.clone(),
                changed,
            ))),
            None => {
                debug!(building = %map.building_name, "discarding map data fetched for a cleared store");
                Ok(None)
            }
        }
    }

    /// Attach an `active` session to the robot, creating a placeholder
    /// robot when the fleet has not reported it yet.
    pub fn apply_dynamic_event_begin(
        &self,
        msg: &RawDynamicEventBegin,
    ) -> Result<ContextUpdate, FleetError> {
        let robot = required(&msg.robot_name, StreamCategory::DynamicEvent, "robot_name")?;
        let fleet = required(&msg.fleet_name, StreamCategory::DynamicEvent, "fleet_name")?;
        let seq = msg.dynamic_event_seq.ok_or_else(|| {
            FleetError::malformed(StreamCategory::DynamicEvent, "missing dynamic_event_seq")
        })?;

        let session = DynamicEventSession {
            seq,
            description: msg.description.clone().unwrap_or_default(),
            start_time: Utc::now(),
            status: DynamicEventStatus::Active,
        };
        self.store.update(|s| {
            match s.get_robot_mut(&robot, &fleet) {
                Some(existing) => existing.dynamic_event = Some(session),
                None => {
                    debug!(robot = %robot, fleet = %fleet, "creating placeholder robot for dynamic event");
                    let mut placeholder = Robot::placeholder(robot.clone(), fleet.clone());
                    placeholder.dynamic_event = Some(session);
                    s.upsert_robot(placeholder);
                }
            }
            s.touch(StreamCategory::DynamicEvent);
        });
        Ok(self.notify(StreamCategory::DynamicEvent, format!("{fleet}/{robot}"), 1))
    }

    /// Update the status of an existing session.  A status for a robot
    /// without a matching session changes nothing but is still reported.
    pub fn apply_dynamic_event_status(
        &self,
        msg: &RawDynamicEventStatus,
    ) -> Result<ContextUpdate, FleetError> {
        let robot = required(&msg.robot_name, StreamCategory::DynamicEvent, "robot_name")?;
        let fleet = required(&msg.fleet_name, StreamCategory::DynamicEvent, "fleet_name")?;
        let Some(label) = msg.status.as_deref() else {
            debug!(robot = %robot, fleet = %fleet, "dynamic event status without a status label");
            self.store.update(|s| s.touch(StreamCategory::DynamicEvent));
            return Ok(self.notify(StreamCategory::DynamicEvent, format!("{fleet}/{robot}"), 0));
        };
        let status = DynamicEventStatus::parse(label).ok_or_else(|| {
            FleetError::malformed(
                StreamCategory::DynamicEvent,
                format!("unknown dynamic event status {label:?}"),
            )
        })?;

        let changed = self.store.update(|s| {
            let changed = s.set_dynamic_event_status(&robot, &fleet, msg.dynamic_event_seq, status);
            s.touch(StreamCategory::DynamicEvent);
            changed
        });
        if !changed {
            debug!(robot = %robot, fleet = %fleet, ?status, "no matching dynamic event session");
        }
        Ok(self.notify(
            StreamCategory::DynamicEvent,
            format!("{fleet}/{robot}"),
            usize::from(changed),
        ))
    }

    fn notify(&self, category: StreamCategory, key: String, changed: usize) -> ContextUpdate {
        let update = ContextUpdate { category, key, changed };
        // Clone the list so observers may (un)register without deadlocking.
        let observers: Vec<UpdateObserver> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(&update);
        }
        update
    }
}

fn required(
    value: &Option<String>,
    category: StreamCategory,
    field: &str,
) -> Result<String, FleetError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| FleetError::malformed(category, format!("missing {field}")))
}

fn location_from_raw(raw: Option<&RawLocation>) -> RobotLocation {
    match raw {
        Some(l) => RobotLocation {
            x: l.x.unwrap_or_default(),
            y: l.y.unwrap_or_default(),
            yaw: l.yaw.unwrap_or_default(),
            level_name: l.level_name.clone().unwrap_or_default(),
        },
        None => RobotLocation::default(),
    }
}

fn robot_from_raw(name: &str, fleet: &str, raw: &RawRobotState) -> RobotReport {
    let session = raw.dynamic_event_seq.map(|seq| SessionReport {
        seq,
        description: raw.dynamic_event_description.clone(),
        start_time: raw.dynamic_event_start_time,
        status: raw.dynamic_event_status.as_deref().and_then(|label| {
            let status = DynamicEventStatus::parse(label);
            if status.is_none() {
                debug!(robot = %name, fleet = %fleet, label, "ignoring unknown dynamic event status");
            }
            status
        }),
    });

    let robot = Robot {
        name: name.to_string(),
        fleet: fleet.to_string(),
        model: raw.model.clone().unwrap_or_default(),
        mode: raw.mode.map(RobotMode::from_code).unwrap_or(RobotMode::Unknown),
        task_id: raw.task_id.clone().unwrap_or_default(),
        location: location_from_raw(raw.location.as_ref()),
        battery_percent: raw.battery_percent.unwrap_or_default().clamp(0.0, 100.0),
        status: raw.status.clone().unwrap_or_else(|| "unknown".to_string()),
        path: raw.path.iter().map(|p| location_from_raw(Some(p))).collect(),
        dynamic_event: None,
        updated_at: Utc::now(),
    };
    RobotReport { robot, session }
}

fn zone_from_raw(raw: &RawZone, level: &str, source: &str) -> Option<Zone> {
    let name = raw.name.as_deref().filter(|n| !n.is_empty())?;
    let vertices: Vec<Point2> = raw.vertices.iter().map(|&(x, y)| Point2::new(x, y)).collect();
    let center = match (raw.center_x, raw.center_y) {
        (Some(x), Some(y)) => Point2::new(x, y),
        _ => centroid(&vertices),
    };
    Some(Zone {
        name: name.to_string(),
        zone_type: raw.zone_type.clone().unwrap_or_default(),
        level: raw.level.clone().unwrap_or_else(|| level.to_string()),
        center,
        width: raw.width.unwrap_or_default(),
        height: raw.height.unwrap_or_default(),
        vertices,
        transition_lanes: raw.transition_lanes.clone(),
        fleets: BTreeSet::from([source.to_string()]),
    })
}

fn centroid(points: &[Point2]) -> Point2 {
    if points.is_empty() {
        return Point2::default();
    }
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2::new(sx / n, sy / n)
}

/// Replace the graph snapshot for `source` and merge its locations and
/// zones.  Returns the number of entities written.
fn merge_graph(state: &mut ContextState, source: &str, level: &str, raw: &RawNavGraph) -> usize {
    let vertices: Vec<GraphVertex> = raw
        .vertices
        .iter()
        .map(|v| GraphVertex {
            name: v.name.clone().unwrap_or_default(),
            position: Point2::new(v.x.unwrap_or_default(), v.y.unwrap_or_default()),
        })
        .collect();
    let edges: Vec<GraphEdge> = raw
        .edges
        .iter()
        .filter(|e| e.v1_idx < vertices.len() && e.v2_idx < vertices.len())
        .map(|e| GraphEdge {
            from: e.v1_idx,
            to: e.v2_idx,
            bidirectional: e.edge_type.unwrap_or(0) == 0,
        })
        .collect();
    if edges.len() != raw.edges.len() {
        warn!(source, dropped = raw.edges.len() - edges.len(), "dropping edges with out-of-range vertex indices");
    }

    let mut changed = 0;
    let mut inserted = 0;
    for raw_vertex in &raw.vertices {
        let Some(name) = raw_vertex.name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };
        let is_charger = raw_vertex.flag("is_charger");
        let is_parking = raw_vertex.flag("is_parking_spot");
        let is_holding = raw_vertex.flag("is_holding_point");
        let location = Location {
            name: name.to_string(),
            position: Point2::new(
                raw_vertex.x.unwrap_or_default(),
                raw_vertex.y.unwrap_or_default(),
            ),
            level: level.to_string(),
            is_charger,
            is_parking,
            is_holding,
            kind: LocationKind::from_flags(is_charger, is_parking, is_holding),
            fleets: BTreeSet::from([source.to_string()]),
        };
        if state.merge_location(location) == MergeOutcome::Inserted {
            inserted += 1;
        }
        changed += 1;
    }

    let mut zone_names = Vec::new();
    for raw_zone in &raw.zones {
        match zone_from_raw(raw_zone, level, source) {
            Some(zone) => {
                zone_names.push(zone.name.clone());
                if state.merge_zone(zone) == MergeOutcome::Inserted {
                    inserted += 1;
                }
                changed += 1;
            }
            None => warn!(source, "skipping zone without a name"),
        }
    }

    state.replace_nav_graph(NavGraph {
        source: source.to_string(),
        level: level.to_string(),
        vertices,
        edges,
        zones: zone_names,
        updated_at: Utc::now(),
    });
    debug!(source, changed, inserted, "nav graph merged");
    changed + 1
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_types::message::{MapLevel, RawEdge, RawParam, RawVertex};
    use std::sync::Mutex;

    fn transformer() -> (StateTransformer, Arc<Mutex<Vec<ContextUpdate>>>) {
        let t = StateTransformer::new(Arc::new(ContextStore::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        t.register_observer(Arc::new(move |u: &ContextUpdate| {
            sink.lock().unwrap().push(u.clone());
        }));
        (t, seen)
    }

    fn raw_robot(name: &str) -> RawRobotState {
        RawRobotState {
            name: Some(name.into()),
            mode: Some(2),
            battery_percent: Some(80.0),
            task_id: Some(format!("task-{name}")),
            ..Default::default()
        }
    }

    fn fleet(name: &str, robots: Vec<RawRobotState>) -> RawFleetState {
        RawFleetState { name: Some(name.into()), robots }
    }

    fn param(name: &str) -> RawParam {
        RawParam { name: name.into(), value_bool: Some(true), value_string: None }
    }

    fn graph(name: Option<&str>, zone_center: (f64, f64)) -> RawNavGraph {
        RawNavGraph {
            name: name.map(str::to_string),
            level: Some("L1".into()),
            vertices: vec![
                RawVertex { name: Some("charger_1".into()), x: Some(0.0), y: Some(0.0), params: vec![param("is_charger"), param("is_parking_spot")] },
                RawVertex { name: None, x: Some(5.0), y: Some(0.0), params: Vec::new() },
                RawVertex { name: Some("hold".into()), x: Some(9.0), y: Some(0.0), params: vec![param("is_holding_point")] },
            ],
            edges: vec![
                RawEdge { v1_idx: 0, v2_idx: 1, edge_type: Some(0) },
                RawEdge { v1_idx: 1, v2_idx: 7, edge_type: Some(1) },
            ],
            zones: vec![RawZone {
                name: Some("A".into()),
                center_x: Some(zone_center.0),
                center_y: Some(zone_center.1),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn fleet_state_notifies_once_per_message() {
        let (t, seen) = transformer();
        let update = t
            .apply_fleet_state(&fleet("fleetA", vec![raw_robot("r1"), raw_robot("r2"), raw_robot("r3")]))
            .unwrap();

        assert_eq!(update.changed, 3);
        assert_eq!(seen.lock().unwrap().len(), 1);
        let r1 = t.store().get_robot("r1", "fleetA").unwrap();
        assert_eq!(r1.mode, RobotMode::Moving);
        assert_eq!(r1.task_id, "task-r1");
        assert!(t.store().fleet("fleetA").is_some());
        assert!(t.store().last_updated(StreamCategory::FleetState).is_some());
    }

    #[test]
    fn robot_without_name_is_skipped_not_fatal() {
        let (t, _) = transformer();
        let update = t
            .apply_fleet_state(&fleet("fleetA", vec![RawRobotState::default(), raw_robot("r1")]))
            .unwrap();
        assert_eq!(update.changed, 1);
        assert_eq!(t.store().robots().len(), 1);
    }

    #[test]
    fn missing_optional_fields_get_defaults() {
        let (t, _) = transformer();
        let bare = RawRobotState { name: Some("r1".into()), ..Default::default() };
        t.apply_fleet_state(&fleet("fleetA", vec![bare])).unwrap();

        let r1 = t.store().get_robot("r1", "fleetA").unwrap();
        assert_eq!(r1.mode, RobotMode::Unknown);
        assert_eq!(r1.battery_percent, 0.0);
        assert_eq!(r1.status, "unknown");
        assert_eq!(r1.location, RobotLocation::default());
    }

    #[test]
    fn dynamic_event_survives_snapshot_without_event_fields() {
        let (t, _) = transformer();
        t.apply_fleet_state(&fleet("fleetA", vec![raw_robot("r1")])).unwrap();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(7),
            description: Some("deliver".into()),
        })
        .unwrap();

        t.apply_fleet_state(&fleet("fleetA", vec![raw_robot("r1")])).unwrap();

        let session = t.store().get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.seq, 7);
        assert_eq!(session.status, DynamicEventStatus::Active);
    }

    #[test]
    fn fleet_without_name_is_malformed_and_silent() {
        let (t, seen) = transformer();
        let err = t.apply_fleet_state(&RawFleetState::default()).unwrap_err();
        assert!(matches!(err, FleetError::Malformed { category: StreamCategory::FleetState, .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn door_and_lift_upsert_by_name() {
        let (t, seen) = transformer();
        t.apply(&TelemetryMessage::DoorState(RawDoorState { door_name: Some("d1".into()), current_mode: Some(0) })).unwrap();
        t.apply(&TelemetryMessage::DoorState(RawDoorState { door_name: Some("d1".into()), current_mode: Some(2) })).unwrap();
        t.apply(&TelemetryMessage::LiftState(RawLiftState {
            lift_name: Some("lift1".into()),
            current_floor: Some("L1".into()),
            available_floors: vec!["L1".into(), "L2".into()],
            ..Default::default()
        }))
        .unwrap();

        let doors = t.store().doors();
        assert_eq!(doors.len(), 1);
        assert_eq!(doors[0].mode, DoorMode::Open);
        let lifts = t.store().lifts();
        assert_eq!(lifts[0].available_floors.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn door_without_name_is_malformed() {
        let (t, _) = transformer();
        assert!(t.apply_door_state(&RawDoorState::default()).is_err());
        assert!(t.store().doors().is_empty());
    }

    #[test]
    fn nav_graph_extracts_locations_and_zones() {
        let (t, seen) = transformer();
        let update = t.apply_nav_graph(&graph(Some("fleet1"), (1.0, 1.0))).unwrap();

        let locations = t.store().locations();
        assert_eq!(locations.len(), 2);
        let charger = locations.iter().find(|l| l.name == "charger_1").unwrap();
        assert_eq!(charger.kind, LocationKind::Charger);
        assert!(charger.is_parking);
        let hold = locations.iter().find(|l| l.name == "hold").unwrap();
        assert_eq!(hold.kind, LocationKind::Holding);

        let nav = t.store().nav_graph("fleet1").unwrap();
        assert_eq!(nav.vertices.len(), 3);
        assert_eq!(nav.edges.len(), 1);
        assert!(nav.edges[0].bidirectional);
        assert_eq!(nav.zones, vec!["A".to_string()]);
        assert_eq!(update.key, "fleet1");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn zones_from_two_fleets_merge() {
        let (t, _) = transformer();
        t.apply_nav_graph(&graph(Some("fleet1"), (1.0, 1.0))).unwrap();
        t.apply_nav_graph(&graph(Some("fleet2"), (1.0, 1.0))).unwrap();
        t.apply_nav_graph(&graph(Some("fleet1"), (1.0, 1.0))).unwrap();

        let zones = t.store().zones();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].fleets, BTreeSet::from(["fleet1".to_string(), "fleet2".to_string()]));
        assert_eq!(t.store().locations()[0].fleets.len(), 2);
    }

    #[test]
    fn zone_center_falls_back_to_vertex_centroid() {
        let raw = RawZone {
            name: Some("Z".into()),
            vertices: vec![(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)],
            ..Default::default()
        };
        let zone = zone_from_raw(&raw, "L1", "f").unwrap();
        assert_eq!(zone.center, Point2::new(1.0, 1.0));
        assert_eq!(zone.level, "L1");
    }

    #[test]
    fn unnamed_graph_uses_placeholder_source() {
        let (t, _) = transformer();
        t.apply_nav_graph(&graph(None, (1.0, 1.0))).unwrap();
        assert!(t.store().nav_graph(UNNAMED_SOURCE).is_some());
    }

    #[test]
    fn map_data_merges_under_building_source() {
        let (t, _) = transformer();
        let map = MapData {
            building_name: "hq".into(),
            levels: vec![MapLevel { name: "L1".into(), elevation: 0.0, nav_graphs: vec![graph(None, (1.0, 1.0))] }],
            doors: Vec::new(),
            lifts: Vec::new(),
        };
        let update = t.apply_map_data(&map, t.store().generation()).unwrap().unwrap();
        assert_eq!(update.key, "hq");
        assert!(t.store().nav_graph(BUILDING_MAP_SOURCE).is_some());
    }

    #[test]
    fn map_data_for_cleared_store_is_discarded() {
        let (t, seen) = transformer();
        let generation = t.store().generation();
        t.store().clear();
        let map = MapData {
            building_name: "hq".into(),
            levels: vec![MapLevel { name: "L1".into(), elevation: 0.0, nav_graphs: vec![graph(None, (1.0, 1.0))] }],
            doors: Vec::new(),
            lifts: Vec::new(),
        };
        assert!(t.apply_map_data(&map, generation).unwrap().is_none());
        assert!(t.store().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn event_begin_for_unknown_robot_creates_placeholder() {
        let (t, _) = transformer();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("ghost".into()),
            fleet_name: Some("fleetZ".into()),
            dynamic_event_seq: Some(3),
            description: None,
        })
        .unwrap();

        let ghost = t.store().get_robot("ghost", "fleetZ").unwrap();
        assert_eq!(ghost.dynamic_event.unwrap().seq, 3);
        assert_eq!(ghost.status, "unknown");
    }

    #[test]
    fn event_begin_without_seq_is_malformed() {
        let (t, _) = transformer();
        let err = t
            .apply_dynamic_event_begin(&RawDynamicEventBegin {
                robot_name: Some("r1".into()),
                fleet_name: Some("fleetA".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, FleetError::Malformed { .. }));
    }

    #[test]
    fn event_status_updates_matching_session() {
        let (t, seen) = transformer();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(4),
            description: None,
        })
        .unwrap();

        let status = |seq, label: &str| RawDynamicEventStatus {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(seq),
            status: Some(label.into()),
        };
        assert_eq!(t.apply_dynamic_event_status(&status(9, "underway")).unwrap().changed, 0);
        assert_eq!(t.apply_dynamic_event_status(&status(4, "completed")).unwrap().changed, 1);
        assert!(t.apply_dynamic_event_status(&status(4, "exploded")).is_err());

        let session = t.store().get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.status, DynamicEventStatus::Completed);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn snapshot_repeating_seq_keeps_description_and_status() {
        let (t, _) = transformer();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(7),
            description: Some("deliver".into()),
        })
        .unwrap();
        t.store().set_dynamic_event_status("r1", "fleetA", Some(7), DynamicEventStatus::Completed);

        let seq_only = RawRobotState { dynamic_event_seq: Some(7), ..raw_robot("r1") };
        t.apply_fleet_state(&fleet("fleetA", vec![seq_only])).unwrap();

        let session = t.store().get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.seq, 7);
        assert_eq!(session.description, "deliver");
        assert_eq!(session.status, DynamicEventStatus::Completed);
    }

    #[test]
    fn snapshot_with_new_seq_starts_fresh_session() {
        let (t, _) = transformer();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(7),
            description: Some("deliver".into()),
        })
        .unwrap();

        let next = RawRobotState {
            dynamic_event_seq: Some(8),
            dynamic_event_status: Some("bogus".into()),
            ..raw_robot("r1")
        };
        t.apply_fleet_state(&fleet("fleetA", vec![next])).unwrap();

        let session = t.store().get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.seq, 8);
        assert!(session.description.is_empty());
        assert_eq!(session.status, DynamicEventStatus::Active);
    }

    #[test]
    fn event_status_without_label_is_a_no_op() {
        let (t, seen) = transformer();
        t.apply_dynamic_event_begin(&RawDynamicEventBegin {
            robot_name: Some("r1".into()),
            fleet_name: Some("fleetA".into()),
            dynamic_event_seq: Some(4),
            description: None,
        })
        .unwrap();

        let update = t
            .apply_dynamic_event_status(&RawDynamicEventStatus {
                robot_name: Some("r1".into()),
                fleet_name: Some("fleetA".into()),
                dynamic_event_seq: Some(4),
                status: None,
            })
            .unwrap();
        assert_eq!(update.changed, 0);
        assert_eq!(seen.lock().unwrap().len(), 2);
        let session = t.store().get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap();
        assert_eq!(session.status, DynamicEventStatus::Active);
    }

    #[test]
    fn unregistered_observer_stops_receiving() {
        let (t, seen) = transformer();
        let extra = t.register_observer(Arc::new(|_: &ContextUpdate| {}));
        assert_eq!(t.observer_count(), 2);
        assert!(t.unregister_observer(extra));
        assert!(!t.unregister_observer(extra));

        t.apply_door_state(&RawDoorState { door_name: Some("d".into()), current_mode: None }).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
