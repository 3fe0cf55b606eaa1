//! Canonical Context Store.
//!
//! Holds every reconciled entity collection behind a single mutation
//! surface.  All writes for one processed message happen inside one
//! [`ContextStore::update`] call, which holds the write lock for the whole
//! transform-and-apply step, so readers never observe a half-applied
//! message.
//!
//! # Collections
//!
//! | Collection | Key | Semantics |
//! |---|---|---|
//! | robots | `(name, fleet)` | replaced per fleet, dynamic event sessions carried forward |
//! | fleets | fleet name | last raw snapshot, most recent wins |
//! | doors, lifts | name | ordered, upsert by linear scan |
//! | zones, locations | `(name, position ± tolerance)` | merged, reporting fleets unioned |
//! | nav graphs | source name | replaced wholesale |
//!
//! # Example
//!
//! ```rust
//! use fleetsync_context::ContextStore;
//! use fleetsync_types::{Door, DoorMode};
//!
//! let store = ContextStore::new();
//! store.upsert_door(Door { name: "d1".into(), mode: DoorMode::Open, updated_at: chrono::Utc::now() });
//! assert_eq!(store.doors().len(), 1);
//!
//! store.clear();
//! assert!(store.doors().is_empty());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use fleetsync_types::message::RawFleetState;
use fleetsync_types::{
    Door, DynamicEventSession, DynamicEventStatus, Fleet, Lift, Location, NavGraph, Robot,
    StreamCategory, Zone,
};
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// MergeOutcome
// ─────────────────────────────────────────────────────────────────────────────

/// What a zone/location merge did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No matching entry existed; the report was appended.
    Inserted,
    /// An entry with the same name and position absorbed the report.
    Merged,
}

// ─────────────────────────────────────────────────────────────────────────────
// RobotReport
// ─────────────────────────────────────────────────────────────────────────────

/// Dynamic event fields exactly as a fleet snapshot carried them.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub seq: u64,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub status: Option<DynamicEventStatus>,
}

impl SessionReport {
    pub fn new(seq: u64) -> Self {
        Self { seq, description: None, start_time: None, status: None }
    }

    /// Fold this report over `previous`.
    ///
    /// Reported fields win.  Missing ones come from `previous` when it has
    /// the same `seq`, otherwise they take their defaults.
    pub fn merge_into(self, previous: Option<&DynamicEventSession>) -> DynamicEventSession {
        let same = previous.filter(|p| p.seq == self.seq);
        DynamicEventSession {
            seq: self.seq,
            description: self
                .description
                .or_else(|| same.map(|p| p.description.clone()))
                .unwrap_or_default(),
            start_time: self
                .start_time
                .or_else(|| same.map(|p| p.start_time))
                .unwrap_or_else(Utc::now),
            status: self
                .status
                .or_else(|| same.map(|p| p.status))
                .unwrap_or(DynamicEventStatus::Active),
        }
    }
}

impl From<DynamicEventSession> for SessionReport {
    fn from(s: DynamicEventSession) -> Self {
        Self {
            seq: s.seq,
            description: Some(s.description),
            start_time: Some(s.start_time),
            status: Some(s.status),
        }
    }
}

/// One robot of a fleet snapshot plus the session fields it reported.
#[derive(Debug, Clone)]
pub struct RobotReport {
    pub robot: Robot,
    pub session: Option<SessionReport>,
}

/// A canonical robot counts as a complete report of its own session.
impl From<Robot> for RobotReport {
    fn from(mut robot: Robot) -> Self {
        let session = robot.dynamic_event.take().map(SessionReport::from);
        Self { robot, session }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContextState
// ─────────────────────────────────────────────────────────────────────────────

/// The collections themselves.  Only reachable through [`ContextStore`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextState {
    robots: Vec<Robot>,
    fleets: HashMap<String, Fleet>,
    doors: Vec<Door>,
    lifts: Vec<Lift>,
    zones: Vec<Zone>,
    locations: Vec<Location>,
    nav_graphs: HashMap<String, NavGraph>,
    last_updated: HashMap<StreamCategory, DateTime<Utc>>,
}

impl ContextState {
    pub fn robots(&self) -> &[Robot] {
        &self.robots
    }

    pub fn doors(&self) -> &[Door] {
        &self.doors
    }

    pub fn lifts(&self) -> &[Lift] {
        &self.lifts
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn nav_graph(&self, source: &str) -> Option<&NavGraph> {
        self.nav_graphs.get(source)
    }

    pub fn nav_graph_count(&self) -> usize {
        self.nav_graphs.len()
    }

    pub fn fleet(&self, name: &str) -> Option<&Fleet> {
        self.fleets.get(name)
    }

    pub fn get_robot(&self, name: &str, fleet: &str) -> Option<&Robot> {
        self.robots.iter().find(|r| r.is(name, fleet))
    }

    pub fn get_robot_mut(&mut self, name: &str, fleet: &str) -> Option<&mut Robot> {
        self.robots.iter_mut().find(|r| r.is(name, fleet))
    }

    /// First robot currently working on `task_id`.  Empty ids never match.
    pub fn find_robot_by_task(&self, task_id: &str) -> Option<&Robot> {
        if task_id.is_empty() {
            return None;
        }
        self.robots.iter().find(|r| r.task_id == task_id)
    }

    /// Insert `robot` or replace the entry with the same `(name, fleet)`.
    pub fn upsert_robot(&mut self, robot: Robot) {
        match self.get_robot_mut(&robot.name, &robot.fleet) {
            Some(existing) => *existing = robot,
            None => self.robots.push(robot),
        }
    }

    /// Replace every robot of `fleet` with `robots`.
    ///
    /// A robot present in both sets keeps its old dynamic event session when
    /// the new report carries none.  A report for the same sequence number
    /// only overwrites the session fields it actually carries.
    pub fn replace_fleet_robots<I>(&mut self, fleet: &str, robots: I)
    where
        I: IntoIterator,
        I::Item: Into<RobotReport>,
    {
        let (previous, others): (Vec<Robot>, Vec<Robot>) =
            std::mem::take(&mut self.robots).into_iter().partition(|r| r.fleet == fleet);
        self.robots = others;

        for report in robots {
            let RobotReport { mut robot, session } = report.into();
            let old = previous
                .iter()
                .find(|o| o.is(&robot.name, fleet))
                .and_then(|o| o.dynamic_event.as_ref());
            robot.dynamic_event = match session {
                Some(reported) => Some(reported.merge_into(old)),
                None => old.cloned(),
            };
            self.robots.push(robot);
        }
    }

    pub fn record_fleet_snapshot(&mut self, name: &str, snapshot: RawFleetState) {
        self.fleets.insert(
            name.to_string(),
            Fleet {
                name: name.to_string(),
                snapshot,
                received_at: Utc::now(),
            },
        );
    }

    /// Returns `true` when the door was new.
    pub fn upsert_door(&mut self, door: Door) -> bool {
        match self.doors.iter_mut().find(|d| d.name == door.name) {
            Some(existing) => {
                *existing = door;
                false
            }
            None => {
                self.doors.push(door);
                true
            }
        }
    }

    /// Returns `true` when the lift was new.
    pub fn upsert_lift(&mut self, lift: Lift) -> bool {
        match self.lifts.iter_mut().find(|l| l.name == lift.name) {
            Some(existing) => {
                *existing = lift;
                false
            }
            None => {
                self.lifts.push(lift);
                true
            }
        }
    }

    pub fn merge_zone(&mut self, zone: Zone) -> MergeOutcome {
        let existing = self
            .zones
            .iter_mut()
            .find(|z| z.name == zone.name && z.center.approx_eq(&zone.center));
        match existing {
            Some(current) => {
                let mut fleets = std::mem::take(&mut current.fleets);
                fleets.extend(zone.fleets.iter().cloned());
                *current = Zone { fleets, ..zone };
                MergeOutcome::Merged
            }
            None => {
                self.zones.push(zone);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn merge_location(&mut self, location: Location) -> MergeOutcome {
        let existing = self
            .locations
            .iter_mut()
            .find(|l| l.name == location.name && l.position.approx_eq(&location.position));
        match existing {
            Some(current) => {
                let mut fleets = std::mem::take(&mut current.fleets);
                fleets.extend(location.fleets.iter().cloned());
                *current = Location { fleets, ..location };
                MergeOutcome::Merged
            }
            None => {
                self.locations.push(location);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn replace_nav_graph(&mut self, graph: NavGraph) {
        self.nav_graphs.insert(graph.source.clone(), graph);
    }

    /// Set the status of the robot's session.  When `seq` is given it must
    /// match the session's sequence number.  Returns `true` on change.
    pub fn set_dynamic_event_status(
        &mut self,
        name: &str,
        fleet: &str,
        seq: Option<u64>,
        status: DynamicEventStatus,
    ) -> bool {
        let Some(session) = self
            .get_robot_mut(name, fleet)
            .and_then(|r| r.dynamic_event.as_mut())
        else {
            return false;
        };
        if seq.is_some_and(|s| s != session.seq) {
            return false;
        }
        session.status = status;
        true
    }

    /// Drop the robot's dynamic event session.  Returns `true` if one existed.
    pub fn clear_dynamic_event(&mut self, name: &str, fleet: &str) -> bool {
        self.get_robot_mut(name, fleet)
            .and_then(|r| r.dynamic_event.take())
            .is_some()
    }

    pub fn touch(&mut self, category: StreamCategory) {
        self.last_updated.insert(category, Utc::now());
    }

    pub fn last_updated(&self, category: StreamCategory) -> Option<DateTime<Utc>> {
        self.last_updated.get(&category).copied()
    }

    /// Reset every collection and timestamp map.
    pub fn clear(&mut self) {
        *self = ContextState::default();
    }

    pub fn is_empty(&self) -> bool {
        self.robots.is_empty()
            && self.fleets.is_empty()
            && self.doors.is_empty()
            && self.lifts.is_empty()
            && self.zones.is_empty()
            && self.locations.is_empty()
            && self.nav_graphs.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContextStore
// ─────────────────────────────────────────────────────────────────────────────

/// Shared, concurrency-safe owner of the canonical context.
///
/// Hand it to components as `Arc<ContextStore>`.  The `generation` counter
/// increments on every [`clear`](Self::clear) so late asynchronous results
/// can detect that the store they were computed for has been torn down.
#[derive(Debug, Default)]
pub struct ContextStore {
    state: RwLock<ContextState>,
    generation: AtomicU64,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access.  Everything `f` does is observed by
    /// readers as one atomic change.
    pub fn update<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Like [`update`](Self::update) but only applies when the store is
    /// still at `generation`.  Returns `None` when it was cleared meanwhile.
    pub fn update_if_generation<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ContextState) -> R,
    ) -> Option<R> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Checked under the write lock: `clear` bumps the counter while holding it.
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        Some(f(&mut guard))
    }

    pub fn read<R>(&self, f: impl FnOnce(&ContextState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Deep copy of the whole context.
    pub fn snapshot(&self) -> ContextState {
        self.read(Clone::clone)
    }

    pub fn robots(&self) -> Vec<Robot> {
        self.read(|s| s.robots.clone())
    }

    pub fn doors(&self) -> Vec<Door> {
        self.read(|s| s.doors.clone())
    }

    pub fn lifts(&self) -> Vec<Lift> {
        self.read(|s| s.lifts.clone())
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.read(|s| s.zones.clone())
    }

    pub fn locations(&self) -> Vec<Location> {
        self.read(|s| s.locations.clone())
    }

    pub fn nav_graph(&self, source: &str) -> Option<NavGraph> {
        self.read(|s| s.nav_graph(source).cloned())
    }

    pub fn fleet(&self, name: &str) -> Option<Fleet> {
        self.read(|s| s.fleet(name).cloned())
    }

    pub fn get_robot(&self, name: &str, fleet: &str) -> Option<Robot> {
        self.read(|s| s.get_robot(name, fleet).cloned())
    }

    pub fn find_robot_by_task(&self, task_id: &str) -> Option<Robot> {
        self.read(|s| s.find_robot_by_task(task_id).cloned())
    }

    pub fn upsert_door(&self, door: Door) -> bool {
        self.update(|s| s.upsert_door(door))
    }

    pub fn upsert_lift(&self, lift: Lift) -> bool {
        self.update(|s| s.upsert_lift(lift))
    }

    pub fn replace_fleet_robots<I>(&self, fleet: &str, robots: I)
    where
        I: IntoIterator,
        I::Item: Into<RobotReport>,
    {
        self.update(|s| s.replace_fleet_robots(fleet, robots))
    }

    pub fn merge_zone(&self, zone: Zone) -> MergeOutcome {
        self.update(|s| s.merge_zone(zone))
    }

    pub fn merge_location(&self, location: Location) -> MergeOutcome {
        self.update(|s| s.merge_location(location))
    }

    pub fn set_dynamic_event_status(
        &self,
        name: &str,
        fleet: &str,
        seq: Option<u64>,
        status: DynamicEventStatus,
    ) -> bool {
        self.update(|s| s.set_dynamic_event_status(name, fleet, seq, status))
    }

    pub fn clear_dynamic_event(&self, name: &str, fleet: &str) -> bool {
        self.update(|s| s.clear_dynamic_event(name, fleet))
    }

    pub fn last_updated(&self, category: StreamCategory) -> Option<DateTime<Utc>> {
        self.read(|s| s.last_updated(category))
    }

    pub fn is_empty(&self) -> bool {
        self.read(ContextState::is_empty)
    }

    /// Reset every collection and advance the generation.
    pub fn clear(&self) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        guard.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
