use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SubmissionError;

/// Shape of a submitted task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Single,
    Group,
    Chord,
    Chain,
    Cron,
}

/// Typed positional argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl Arg {
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }

    pub fn json(value: Value) -> Self {
        Self::new("json", value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new("string", Value::String(value.into()))
    }
}

/// One queued task instance (a "step" on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub task_name: String,
    #[serde(default)]
    pub task_priority: u8,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub retry_count: u32,
    /// When set, results of the parent are not prepended to this task's args.
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub group_uuid: String,
    #[serde(default)]
    pub group_task_count: usize,
    #[serde(default)]
    pub on_success: Vec<Signature>,
    #[serde(default)]
    pub on_error: Vec<Signature>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord_callback: Option<Box<Signature>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

pub fn new_task_uuid() -> String {
    format!("task_{}", Uuid::new_v4())
}

pub fn new_group_uuid() -> String {
    format!("group_{}", Uuid::new_v4())
}

impl Signature {
    pub fn new(task_name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn on_error(mut self, sig: Signature) -> Self {
        self.on_error.push(sig);
        self
    }

    pub fn on_success(mut self, sig: Signature) -> Self {
        self.on_success.push(sig);
        self
    }

    /// Gives this signature an id if it has none, then stamps every nested
    /// on-success/on-error branch (and the chord callback) with a fresh id
    /// and the parent's routing key.
    ///
    /// Nested ids are always regenerated: the same template branch may be
    /// attached to several parents and each copy must be tracked on its own.
    pub fn assign_ids(&mut self) {
        if self.uuid.is_empty() {
            self.uuid = new_task_uuid();
        }
        let routing_key = self.routing_key.clone();
        for child in self.on_success.iter_mut().chain(self.on_error.iter_mut()) {
            child.stamp_branch(&routing_key);
        }
        if let Some(callback) = self.chord_callback.as_deref_mut() {
            callback.stamp_branch(&routing_key);
        }
    }

    fn stamp_branch(&mut self, routing_key: &str) {
        self.uuid = new_task_uuid();
        if self.routing_key.is_empty() {
            self.routing_key = routing_key.to_string();
        }
        let routing_key = self.routing_key.clone();
        for child in self.on_success.iter_mut().chain(self.on_error.iter_mut()) {
            child.stamp_branch(&routing_key);
        }
        if let Some(callback) = self.chord_callback.as_deref_mut() {
            callback.stamp_branch(&routing_key);
        }
    }

    /// Structural checks, recursively over nested branches.
    pub fn validate(&self, index: usize) -> Result<(), SubmissionError> {
        if self.task_name.trim().is_empty() {
            return Err(SubmissionError::MissingTaskName { index });
        }
        for (i, arg) in self.args.iter().enumerate() {
            if arg.kind.is_empty() || arg.value.is_null() {
                return Err(SubmissionError::MissingArgument {
                    task_name: self.task_name.clone(),
                    index: i,
                });
            }
        }
        for (i, child) in self.on_success.iter().chain(self.on_error.iter()).enumerate() {
            child.validate(i)?;
        }
        if let Some(callback) = &self.chord_callback {
            callback.validate(0)?;
        }
        Ok(())
    }

    /// Every task name reachable from this signature.
    pub fn task_names(&self) -> Vec<&str> {
        let mut names = vec![self.task_name.as_str()];
        for child in self.on_success.iter().chain(self.on_error.iter()) {
            names.extend(child.task_names());
        }
        if let Some(callback) = &self.chord_callback {
            names.extend(callback.task_names());
        }
        names
    }
}

/// Submission payload accepted by the queue adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    pub steps: Vec<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_task: Option<Signature>,
}

impl SubmitRequest {
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.task_type == TaskType::Cron {
            return Err(SubmissionError::Unsupported(TaskType::Cron));
        }
        if self.steps.is_empty() {
            return Err(SubmissionError::EmptySteps);
        }
        if self.task_type == TaskType::Single && self.steps.len() != 1 {
            return Err(SubmissionError::StepCount {
                task_type: self.task_type,
                count: self.steps.len(),
            });
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(i)?;
        }
        match (&self.task_type, &self.callback_task) {
            (TaskType::Chord, None) => return Err(SubmissionError::MissingCallback),
            (_, Some(callback)) => callback.validate(0)?,
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Every step id of a chain, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain_ids: Vec<String>,
}

/// Execution state of one queued instance, as recorded by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureStatus {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
}

impl SignatureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignatureStatus::Success | SignatureStatus::Failure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureState {
    pub task_uuid: String,
    pub task_name: String,
    pub state: SignatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub share_data: BTreeMap<String, String>,
    #[serde(default)]
    pub attempts: u32,
}

impl SignatureState {
    pub fn new(sig: &Signature, state: SignatureStatus) -> Self {
        Self {
            task_uuid: sig.uuid.clone(),
            task_name: sig.task_name.clone(),
            state,
            result: None,
            error: None,
            share_data: BTreeMap::new(),
            attempts: 0,
        }
    }

    /// Stand-in for an instance that has not recorded any state yet.
    pub fn pending(task_uuid: String) -> Self {
        Self {
            task_uuid,
            task_name: String::new(),
            state: SignatureStatus::Pending,
            result: None,
            error: None,
            share_data: BTreeMap::new(),
            attempts: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
