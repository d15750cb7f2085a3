use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Success | FlowStatus::Failed)
    }

    /// Flow state as a function of its tasks' states.
    ///
    /// Running while anything runs; then Failed if any task failed; Success
    /// once all succeeded; Pending if nothing has started.
    pub fn derive<I>(states: I) -> FlowStatus
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let mut any_running = false;
        let mut any_failed = false;
        let mut all_success = true;
        let mut all_pending = true;
        for state in states {
            any_running |= state == TaskStatus::Running;
            any_failed |= state == TaskStatus::Failed;
            all_success &= state == TaskStatus::Success;
            all_pending &= state == TaskStatus::Pending;
        }

        if any_running {
            FlowStatus::Running
        } else if any_failed {
            FlowStatus::Failed
        } else if all_success {
            FlowStatus::Success
        } else if all_pending {
            FlowStatus::Pending
        } else {
            FlowStatus::Running
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// One asynchronous business operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub state: FlowStatus,
    /// Task ids in template order.
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Visible to every task of the flow; tasks may add to it.
    #[serde(default)]
    pub share_data: BTreeMap<String, String>,
}

/// Follow-up work dispatched after a task succeeds or fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub action_name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub flow_id: String,
    pub flow_name: String,
    pub action_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub retry_count: u32,
    pub timeout_secs: u64,
    /// Ids of tasks in the same flow that must succeed first.
    #[serde(default)]
    pub depend_on: Vec<String>,
    pub state: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<SubTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<SubTask>,
    /// Queue instance id of the current dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}
