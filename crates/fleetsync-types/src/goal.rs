//! Action-goal payloads and the three-channel output contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Outbound goal submitted through the action-goal transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRequest {
    pub goal_id: Uuid,
    pub robot_name: String,
    pub fleet_name: String,
    /// Event category, e.g. `"go_to_place"` or `"perform_action"`.
    pub category: String,
    pub dynamic_event_seq: u64,
    pub expected_task_id: String,
    pub event_data: Value,
}

/// Intermediate progress reported for an in-flight goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalFeedback {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Terminal outcome of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// One emission on the node-facing output contract: a 3-tuple of optional
/// messages `[success, failure, status]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GoalOutput {
    pub success: Option<Value>,
    pub failure: Option<Value>,
    pub status: Option<Value>,
}

impl GoalOutput {
    pub fn success(msg: Value) -> Self {
        Self { success: Some(msg), ..Self::default() }
    }

    pub fn failure(msg: Value) -> Self {
        Self { failure: Some(msg), ..Self::default() }
    }

    pub fn status(msg: Value) -> Self {
        Self { status: Some(msg), ..Self::default() }
    }

    pub fn is_terminal(&self) -> bool {
        self.success.is_some() || self.failure.is_some()
    }
}

/// Shallow-merge `overlay` into `base`.  Non-object bases are replaced by an
/// empty object first so the result is always an object.
pub fn merge_objects(base: &Value, overlay: &Value) -> Value {
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    if let Some(extra) = overlay.as_object() {
        for (k, v) in extra {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}
