//! Simulated fleet traffic for the demo binary.

use std::f64::consts::TAU;

use fleetsync_middleware::{GoalScript, SimTransport};
use fleetsync_types::message::{
    MapLevel, RawDoorState, RawDynamicEventBegin, RawEdge, RawFleetState, RawLiftState,
    RawLocation, RawNavGraph, RawParam, RawRobotState, RawVertex, RawZone,
};
use fleetsync_types::{GoalFeedback, GoalResult, MapData, TelemetryMessage};
use serde_json::json;

pub const FLEET: &str = "demo_fleet";
const LEVEL: &str = "L1";

pub fn robot_name(i: usize) -> String {
    format!("tinyRobot{}", i + 1)
}

/// Emits one round of telemetry per call; `tick` drives robot motion and
/// door cycling.
pub struct DemoFleet {
    robots: usize,
    tick: u64,
}

impl DemoFleet {
    pub fn new(robots: usize) -> Self {
        Self { robots: robots.max(1), tick: 0 }
    }

    /// Publish the static parts of the site: nav graph and the first
    /// robot's task session.
    pub fn seed(&self, sim: &SimTransport) {
        sim.emit("nav_graphs", TelemetryMessage::NavGraph(nav_graph()));
        sim.emit(
            "dynamic_event_begin",
            TelemetryMessage::DynamicEventBegin(RawDynamicEventBegin {
                robot_name: Some(robot_name(0)),
                fleet_name: Some(FLEET.into()),
                dynamic_event_seq: Some(1),
                description: Some("patrol".into()),
            }),
        );
    }

    pub fn step(&mut self, sim: &SimTransport) {
        self.tick += 1;
        let t = self.tick as f64 / 50.0;

        let robots = (0..self.robots)
            .map(|i| {
                let phase = t + i as f64 * TAU / self.robots as f64;
                RawRobotState {
                    name: Some(robot_name(i)),
                    model: Some("tinyRobot".into()),
                    task_id: Some(format!("patrol-{}", i + 1)),
                    mode: Some(2),
                    battery_percent: Some(100.0 - (self.tick % 1000) as f64 / 10.0),
                    status: Some("working".into()),
                    location: Some(RawLocation {
                        x: Some(5.0 + 3.0 * phase.cos()),
                        y: Some(5.0 + 3.0 * phase.sin()),
                        yaw: Some(phase),
                        level_name: Some(LEVEL.into()),
                    }),
                    ..Default::default()
                }
            })
            .collect();
        sim.emit(
            "fleet_states",
            TelemetryMessage::FleetState(RawFleetState { name: Some(FLEET.into()), robots }),
        );

        let door_mode = ((self.tick / 20) % 3) as u32;
        sim.emit(
            "door_states",
            TelemetryMessage::DoorState(RawDoorState {
                door_name: Some("main_door".into()),
                current_mode: Some(door_mode),
            }),
        );

        let floor = if (self.tick / 40) % 2 == 0 { "L1" } else { "L2" };
        sim.emit(
            "lift_states",
            TelemetryMessage::LiftState(RawLiftState {
                lift_name: Some("lift_1".into()),
                current_floor: Some(floor.into()),
                destination_floor: Some(floor.into()),
                available_floors: vec!["L1".into(), "L2".into()],
                door_state: Some(door_mode),
                ..Default::default()
            }),
        );
    }
}

fn vertex(name: &str, x: f64, y: f64, flag: Option<&str>) -> RawVertex {
    RawVertex {
        name: Some(name.into()),
        x: Some(x),
        y: Some(y),
        params: flag
            .map(|f| {
                vec![RawParam {
                    name: f.into(),
                    value_bool: Some(true),
                    value_string: None,
                }]
            })
            .unwrap_or_default(),
    }
}

fn nav_graph() -> RawNavGraph {
    RawNavGraph {
        name: Some(FLEET.into()),
        level: Some(LEVEL.into()),
        vertices: vec![
            vertex("charger_1", 2.0, 2.0, Some("is_charger")),
            vertex("pantry", 8.0, 2.0, None),
            vertex("lobby", 8.0, 8.0, Some("is_holding_point")),
            vertex("parking_1", 2.0, 8.0, Some("is_parking_spot")),
        ],
        edges: (0..4)
            .map(|i| RawEdge { v1_idx: i, v2_idx: (i + 1) % 4, edge_type: Some(0) })
            .collect(),
        zones: vec![RawZone {
            name: Some("lobby_zone".into()),
            zone_type: Some("restricted".into()),
            level: Some(LEVEL.into()),
            center_x: Some(8.0),
            center_y: Some(8.0),
            width: Some(2.0),
            height: Some(2.0),
            ..Default::default()
        }],
    }
}

/// Building map served by the simulated map source.
pub fn building_map() -> MapData {
    MapData {
        building_name: "demo_building".into(),
        levels: vec![MapLevel {
            name: LEVEL.into(),
            elevation: 0.0,
            nav_graphs: vec![RawNavGraph {
                vertices: vec![
                    vertex("pantry", 8.0, 2.0, None),
                    vertex("charger_2", 5.0, 1.0, Some("is_charger")),
                ],
                ..Default::default()
            }],
        }],
        doors: vec!["main_door".into()],
        lifts: vec!["lift_1".into()],
    }
}

/// Goal replay for the demo dispatch: two progress reports, then success.
pub fn goal_script() -> GoalScript {
    GoalScript {
        feedback: vec![
            GoalFeedback { status: Some("underway".into()), payload: json!({ "progress": 0.5 }) },
            GoalFeedback { status: Some("underway".into()), payload: json!({ "progress": 0.9 }) },
        ],
        result: Some(GoalResult {
            success: true,
            message: Some("arrived".into()),
            payload: json!({ "place": "pantry" }),
        }),
        reject: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_middleware::TelemetryTransport;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn step_emits_every_telemetry_topic() {
        let sim = SimTransport::new();
        sim.connect(0).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for topic in ["fleet_states", "door_states", "lift_states"] {
            let seen = Arc::clone(&seen);
            sim.subscribe(
                topic,
                fleetsync_middleware::QosHint::telemetry(),
                Arc::new(move |msg: TelemetryMessage| seen.lock().unwrap().push(msg.category())),
            )
            .unwrap();
        }

        let mut fleet = DemoFleet::new(3);
        fleet.step(&sim);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn nav_graph_edges_stay_in_range() {
        let g = nav_graph();
        assert!(g.edges.iter().all(|e| e.v1_idx < g.vertices.len() && e.v2_idx < g.vertices.len()));
    }
}
