use std::time::Duration;

use crate::queue::signature::TaskType;

/// Rejected submissions. Nothing has been enqueued when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("submission contains no steps")]
    EmptySteps,

    #[error("step {index} has no task name")]
    MissingTaskName { index: usize },

    #[error("task '{task_name}' argument {index} is missing its type or value")]
    MissingArgument { task_name: String, index: usize },

    #[error("{task_type:?} submission expects exactly one step, got {count}")]
    StepCount { task_type: TaskType, count: usize },

    #[error("chord submission requires a callback task")]
    MissingCallback,

    #[error("task '{name}' is not registered in namespace '{namespace}'")]
    UnregisteredTask { namespace: String, name: String },

    #[error("task '{task_name}' rejected its arguments: {message}")]
    InvalidArguments { task_name: String, message: String },

    #[error("task type {0:?} is not supported by this adapter")]
    Unsupported(TaskType),

    #[error("failed to serialize signature")]
    Serialization(#[from] serde_json::Error),

    #[error("broker unavailable")]
    Broker(#[source] anyhow::Error),
}

/// Failures of the eventual-consistency poller.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("polling {resource} did not settle within {timeout:?}")]
    Timeout { resource: String, timeout: Duration },

    #[error("polling {resource} was cancelled")]
    Cancelled { resource: String },

    #[error("no ids to poll")]
    EmptyIds,
}

/// Failures of a bounded wait on a Flow.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("flow {flow_id} did not finish within {timeout:?}")]
    Timeout { flow_id: String, timeout: Duration },

    #[error("flow {flow_id} failed: {reason}")]
    FlowFailed { flow_id: String, reason: String },

    #[error("flow {flow_id} not found")]
    NotFound { flow_id: String },

    #[error("wait for flow {flow_id} was cancelled")]
    Cancelled { flow_id: String },

    #[error("flow store error")]
    Store(#[source] anyhow::Error),
}

/// Failures while instantiating a Flow from a template or step list.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("flow '{0}' has no steps")]
    EmptyFlow(String),

    #[error("duplicate step key '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected among steps: {0:?}")]
    Cycle(Vec<String>),

    #[error("parameter override for action '{0}' matches no step")]
    UnmatchedOverride(String),

    #[error("id allocator returned {got} ids, expected {expected}")]
    IdCountMismatch { expected: usize, got: usize },

    #[error("flow store error")]
    Store(#[source] anyhow::Error),
}
