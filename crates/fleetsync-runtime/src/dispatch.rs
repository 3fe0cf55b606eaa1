//! [`GoalDispatcher`] – goal submission and result correlation.
//!
//! [`GoalDispatcher::send_goal`] resolves the target robot, submits a
//! [`GoalRequest`] through the [`GoalTransport`] and returns a receiver of
//! [`GoalOutput`]s.  The receiver yields zero or more `status` outputs,
//! then exactly one `success` or `failure`, then closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fleetsync_context::ContextStore;
use fleetsync_middleware::{GoalHandle, GoalTransport};
use fleetsync_types::goal::merge_objects;
use fleetsync_types::message::meaningful;
use fleetsync_types::{
    DynamicEventStatus, FleetError, GoalFeedback, GoalOutput, GoalRequest, GoalResult, Robot,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OUTPUT_CAPACITY: usize = 32;

/// Identifiers supplied by the caller of a dispatch.  Values that are not
/// meaningful (empty, `"all"`, `"auto"`) are treated as absent.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub robot_name: Option<String>,
    pub fleet_name: Option<String>,
    pub task_id: Option<String>,
}

impl CallerContext {
    pub fn robot(name: impl Into<String>, fleet: impl Into<String>) -> Self {
        Self {
            robot_name: Some(name.into()),
            fleet_name: Some(fleet.into()),
            task_id: None,
        }
    }
}

pub struct GoalDispatcher {
    store: Arc<ContextStore>,
    transport: Arc<dyn GoalTransport>,
    quiet: AtomicBool,
}

impl GoalDispatcher {
    pub fn new(store: Arc<ContextStore>, transport: Arc<dyn GoalTransport>) -> Self {
        Self {
            store,
            transport,
            quiet: AtomicBool::new(false),
        }
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::Relaxed);
    }

    /// Find the robot a dispatch targets.
    ///
    /// Order: explicit `(robot, fleet)`, then the robot working on the
    /// caller's task, then the first robot with the given name.
    pub fn resolve_robot(&self, caller: &CallerContext) -> Result<Robot, FleetError> {
        let robot = meaningful(caller.robot_name.as_deref());
        let fleet = meaningful(caller.fleet_name.as_deref());
        let task = meaningful(caller.task_id.as_deref());

        let found = match (robot, fleet) {
            (Some(r), Some(f)) => self.store.get_robot(r, f),
            _ => None,
        }
        .or_else(|| task.and_then(|t| self.store.find_robot_by_task(t)))
        .or_else(|| {
            robot.and_then(|r| {
                self.store.read(|s| {
                    s.robots()
                        .iter()
                        .find(|candidate| {
                            candidate.name == r && fleet.is_none_or(|f| candidate.fleet == f)
                        })
                        .cloned()
                })
            })
        });

        found.ok_or_else(|| {
            FleetError::Dispatch(format!(
                "no robot matches robot={} fleet={} task={}",
                robot.unwrap_or("-"),
                fleet.unwrap_or("-"),
                task.unwrap_or("-"),
            ))
        })
    }

    /// Build the goal for `caller` without submitting it.
    pub fn build_goal(
        &self,
        category: &str,
        event_data: Value,
        caller: &CallerContext,
    ) -> Result<GoalRequest, FleetError> {
        let robot = self.resolve_robot(caller)?;
        let session = robot
            .dynamic_event
            .as_ref()
            .filter(|s| !s.status.is_terminal())
            .ok_or_else(|| {
                FleetError::Dispatch(format!(
                    "robot {}/{} has no active dynamic event",
                    robot.fleet, robot.name
                ))
            })?;
        let expected_task_id = meaningful(caller.task_id.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| robot.task_id.clone());

        Ok(GoalRequest {
            goal_id: Uuid::new_v4(),
            robot_name: robot.name.clone(),
            fleet_name: robot.fleet.clone(),
            category: category.to_string(),
            dynamic_event_seq: session.seq,
            expected_task_id,
            event_data,
        })
    }

    /// Submit a goal and correlate its feedback and result.
    ///
    /// Resolution or submission failures yield a single `failure` output.
    pub async fn send_goal(
        &self,
        category: &str,
        event_data: Value,
        success_template: Value,
        caller: &CallerContext,
    ) -> mpsc::Receiver<GoalOutput> {
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);

        let goal = match self.build_goal(category, event_data, caller) {
            Ok(goal) => goal,
            Err(e) => {
                warn!(category, error = %e, "goal not dispatched");
                let _ = tx.send(GoalOutput::failure(failure_payload(&e, None))).await;
                return rx;
            }
        };

        info!(
            goal_id = %goal.goal_id,
            robot = %goal.robot_name,
            fleet = %goal.fleet_name,
            category,
            seq = goal.dynamic_event_seq,
            "dispatching goal"
        );
        let handle = match self.transport.submit_goal(goal.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(goal_id = %goal.goal_id, error = %e, "goal submission rejected");
                let e = match e {
                    FleetError::Dispatch(_) => e,
                    other => FleetError::Dispatch(other.to_string()),
                };
                let _ = tx.send(GoalOutput::failure(failure_payload(&e, Some(&goal)))).await;
                return rx;
            }
        };

        tokio::spawn(correlate(
            Arc::clone(&self.store),
            goal,
            handle,
            success_template,
            tx,
            self.quiet.load(Ordering::Relaxed),
        ));
        rx
    }
}

async fn correlate(
    store: Arc<ContextStore>,
    goal: GoalRequest,
    handle: GoalHandle,
    success_template: Value,
    tx: mpsc::Sender<GoalOutput>,
    quiet: bool,
) {
    let GoalHandle {
        mut feedback,
        mut result,
    } = handle;
    let mut feedback_open = true;

    let outcome = loop {
        tokio::select! {
            biased;
            fb = feedback.recv(), if feedback_open => match fb {
                Some(fb) => {
                    if !quiet {
                        debug!(goal_id = %goal.goal_id, status = ?fb.status, "goal feedback");
                    }
                    let _ = tx.send(GoalOutput::status(status_payload(&store, &goal, fb))).await;
                }
                None => feedback_open = false,
            },
            res = &mut result => break res,
        }
    };

    // Feedback queued before the result still goes out first.
    while let Ok(fb) = feedback.try_recv() {
        let _ = tx.send(GoalOutput::status(status_payload(&store, &goal, fb))).await;
    }

    let output = match outcome {
        Ok(GoalResult { success: true, payload, .. }) => {
            write_back(&store, &goal, DynamicEventStatus::Completed);
            info!(goal_id = %goal.goal_id, "goal succeeded");
            GoalOutput::success(success_payload(&success_template, &payload, &goal))
        }
        Ok(GoalResult { message, payload, .. }) => {
            write_back(&store, &goal, DynamicEventStatus::Failed);
            let e = FleetError::Dispatch(message.unwrap_or_else(|| "goal failed".to_string()));
            warn!(goal_id = %goal.goal_id, error = %e, "goal failed");
            let mut failure = failure_payload(&e, Some(&goal));
            if !payload.is_null() {
                failure["payload"] = payload;
            }
            GoalOutput::failure(failure)
        }
        Err(_) => {
            write_back(&store, &goal, DynamicEventStatus::Failed);
            let e = FleetError::Dispatch("goal transport dropped the result".to_string());
            warn!(goal_id = %goal.goal_id, error = %e, "goal lost");
            GoalOutput::failure(failure_payload(&e, Some(&goal)))
        }
    };
    let _ = tx.send(output).await;
}

fn write_back(store: &ContextStore, goal: &GoalRequest, status: DynamicEventStatus) {
    if !store.set_dynamic_event_status(
        &goal.robot_name,
        &goal.fleet_name,
        Some(goal.dynamic_event_seq),
        status,
    ) {
        debug!(goal_id = %goal.goal_id, "no session to update for finished goal");
    }
}

fn correlation(goal: &GoalRequest) -> Value {
    json!({
        "goal_id": goal.goal_id.to_string(),
        "robot_name": goal.robot_name,
        "fleet_name": goal.fleet_name,
        "dynamic_event_seq": goal.dynamic_event_seq,
        "task_id": goal.expected_task_id,
    })
}

fn success_payload(template: &Value, completion: &Value, goal: &GoalRequest) -> Value {
    let merged = merge_objects(template, completion);
    merge_objects(&merged, &correlation(goal))
}

fn failure_payload(e: &FleetError, goal: Option<&GoalRequest>) -> Value {
    let base = json!({ "error": e.to_string() });
    match goal {
        Some(goal) => merge_objects(&base, &correlation(goal)),
        None => base,
    }
}

fn status_payload(store: &ContextStore, goal: &GoalRequest, fb: GoalFeedback) -> Value {
    let mode = store
        .get_robot(&goal.robot_name, &goal.fleet_name)
        .map(|r| r.mode.as_str())
        .unwrap_or("unknown");
    let mut status = json!({
        "goal_id": goal.goal_id.to_string(),
        "robot_name": goal.robot_name,
        "fleet_name": goal.fleet_name,
        "robot_mode": mode,
        "payload": fb.payload,
    });
    if let Some(label) = fb.status {
        status["status"] = Value::String(label);
    }
    status
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetsync_middleware::{GoalScript, SimTransport, TelemetryTransport};
    use fleetsync_types::{DynamicEventSession, RobotMode};

    async fn setup() -> (GoalDispatcher, Arc<SimTransport>, Arc<ContextStore>) {
        let store = Arc::new(ContextStore::new());
        let mut robot = Robot::placeholder("r1", "fleetA");
        robot.mode = RobotMode::Moving;
        robot.task_id = "task-1".into();
        robot.dynamic_event = Some(DynamicEventSession {
            seq: 7,
            description: "deliver".into(),
            start_time: Utc::now(),
            status: DynamicEventStatus::Active,
        });
        store.update(|s| s.upsert_robot(robot));

        let sim = Arc::new(SimTransport::new());
        sim.connect(0).await.unwrap();
        let dispatcher = GoalDispatcher::new(Arc::clone(&store), sim.clone());
        (dispatcher, sim, store)
    }

    async fn drain(mut rx: mpsc::Receiver<GoalOutput>) -> Vec<GoalOutput> {
        let mut out = Vec::new();
        while let Some(o) = rx.recv().await {
            out.push(o);
        }
        out
    }

    fn feedback(n: u32) -> GoalFeedback {
        GoalFeedback { status: Some("underway".into()), payload: json!({ "step": n }) }
    }

    #[tokio::test]
    async fn two_feedbacks_then_success() {
        let (d, sim, store) = setup().await;
        sim.set_goal_script(GoalScript {
            feedback: vec![feedback(1), feedback(2)],
            result: Some(GoalResult { success: true, message: None, payload: json!({ "arrived": true }) }),
            reject: None,
        });

        let outputs = drain(
            d.send_goal("go_to_place", json!({"place": "dock"}), json!({"topic": "done"}), &CallerContext::robot("r1", "fleetA"))
                .await,
        )
        .await;

        let statuses: Vec<_> = outputs.iter().filter(|o| o.status.is_some()).collect();
        let successes: Vec<_> = outputs.iter().filter(|o| o.success.is_some()).collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(successes.len(), 1);
        assert!(outputs.iter().all(|o| o.failure.is_none()));
        assert!(outputs.last().unwrap().is_terminal());

        assert_eq!(statuses[0].status.as_ref().unwrap()["robot_mode"], "moving");
        let success = successes[0].success.as_ref().unwrap();
        assert_eq!(success["topic"], "done");
        assert_eq!(success["arrived"], true);
        assert_eq!(success["dynamic_event_seq"], 7);
        assert_eq!(success["task_id"], "task-1");

        let goal = &sim.submitted_goals()[0];
        assert_eq!(goal.dynamic_event_seq, 7);
        assert_eq!(goal.category, "go_to_place");
        assert_eq!(
            store.get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap().status,
            DynamicEventStatus::Completed
        );
    }

    #[tokio::test]
    async fn unsuccessful_result_is_single_failure() {
        let (d, sim, store) = setup().await;
        sim.set_goal_script(GoalScript {
            feedback: vec![],
            result: Some(GoalResult { success: false, message: Some("blocked".into()), payload: Value::Null }),
            reject: None,
        });

        let outputs = drain(d.send_goal("go_to_place", json!({}), json!({}), &CallerContext::robot("r1", "fleetA")).await).await;
        assert_eq!(outputs.len(), 1);
        let failure = outputs[0].failure.as_ref().unwrap();
        assert!(failure["error"].as_str().unwrap().contains("blocked"));
        assert_eq!(
            store.get_robot("r1", "fleetA").unwrap().dynamic_event.unwrap().status,
            DynamicEventStatus::Failed
        );
    }

    #[tokio::test]
    async fn rejected_submission_is_immediate_failure() {
        let (d, sim, _) = setup().await;
        sim.set_goal_script(GoalScript {
            reject: Some(FleetError::Unavailable("action server not ready".into())),
            ..Default::default()
        });
        let outputs = drain(d.send_goal("go_to_place", json!({}), json!({}), &CallerContext::robot("r1", "fleetA")).await).await;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].failure.is_some());
    }

    #[tokio::test]
    async fn dropped_result_counts_as_failure() {
        let (d, sim, _) = setup().await;
        sim.set_goal_script(GoalScript { feedback: vec![feedback(1)], result: None, reject: None });
        let rx = d.send_goal("go_to_place", json!({}), json!({}), &CallerContext::robot("r1", "fleetA")).await;
        // Disconnect drops the parked result sender.
        sim.disconnect().await.unwrap();

        let outputs = drain(rx).await;
        assert_eq!(outputs.len(), 2);
        assert!(outputs[0].status.is_some());
        assert!(outputs[1].failure.is_some());
    }

    #[tokio::test]
    async fn sentinel_identifiers_fall_back_to_task_lookup() {
        let (d, _, _) = setup().await;
        let caller = CallerContext {
            robot_name: Some("auto".into()),
            fleet_name: Some("all".into()),
            task_id: Some("task-1".into()),
        };
        let goal = d.build_goal("perform_action", json!({}), &caller).unwrap();
        assert_eq!(goal.robot_name, "r1");
        assert_eq!(goal.fleet_name, "fleetA");
    }

    #[tokio::test]
    async fn robot_name_alone_is_enough() {
        let (d, _, _) = setup().await;
        let caller = CallerContext { robot_name: Some("r1".into()), ..Default::default() };
        assert_eq!(d.resolve_robot(&caller).unwrap().fleet, "fleetA");
    }

    #[tokio::test]
    async fn unknown_robot_or_missing_session_fails() {
        let (d, _, store) = setup().await;
        let outputs = drain(d.send_goal("x", json!({}), json!({}), &CallerContext::robot("nobody", "fleetA")).await).await;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].failure.is_some());

        store.clear_dynamic_event("r1", "fleetA");
        let err = d.build_goal("x", json!({}), &CallerContext::robot("r1", "fleetA")).unwrap_err();
        assert!(matches!(err, FleetError::Dispatch(_)));
    }

    #[tokio::test]
    async fn finished_session_is_not_dispatched_again() {
        let (d, sim, store) = setup().await;
        let caller = CallerContext::robot("r1", "fleetA");
        assert!(d.build_goal("x", json!({}), &caller).is_ok());

        store.set_dynamic_event_status("r1", "fleetA", Some(7), DynamicEventStatus::Canceled);
        let outputs = drain(d.send_goal("x", json!({}), json!({}), &caller).await).await;
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].failure.is_some());
        assert!(sim.submitted_goals().is_empty());

        store.set_dynamic_event_status("r1", "fleetA", Some(7), DynamicEventStatus::Underway);
        assert!(d.build_goal("x", json!({}), &caller).is_ok());
    }
}
