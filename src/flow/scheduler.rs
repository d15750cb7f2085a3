use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{FLOW_ID_HEADER, SHARE_HEADER_PREFIX};
use crate::flow::model::{Flow, FlowStatus, SubTask, Task, TaskStatus};
use crate::flow::store::{FlowFilter, FlowStore, TaskFilter, list_all_flows, list_all_tasks};
use crate::queue::{Arg, QueueAdapter, Signature, SignatureStatus};

/// Reason recorded on a task whose dispatch outlived its timeout.
pub const TASK_TIMEOUT_REASON: &str = "task execution timeout";

const MIN_TICK: Duration = Duration::from_millis(1);

/// Upper bound on how long one dispatch is followed.
pub const MAX_TASK_DEADLINE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// What happens to the rest of a flow once one task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching. Tasks already in the queue are still followed to
    /// their own terminal state.
    #[default]
    FailFast,
    /// Independent branches run to completion; dependents of the failed
    /// task stay Pending.
    ContinueIndependent,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub failure_policy: FailurePolicy,
    /// How often in-flight task states are read back from the queue.
    pub dispatch_poll: Duration,
    /// How often the watch loop looks for flows to drive.
    pub tick: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            dispatch_poll: Duration::from_millis(100),
            tick: Duration::from_secs(1),
        }
    }
}

struct Dispatch {
    instance_id: String,
    deadline: Instant,
}

/// Drives flows through the queue, releasing each task only once every
/// task it depends on has succeeded.
pub struct FlowScheduler {
    store: Arc<dyn FlowStore>,
    adapter: Arc<QueueAdapter>,
    options: SchedulerOptions,
    active: DashSet<String>,
}

impl FlowScheduler {
    pub fn new(store: Arc<dyn FlowStore>, adapter: Arc<QueueAdapter>, options: SchedulerOptions) -> Self {
        Self {
            store,
            adapter,
            options,
            active: DashSet::new(),
        }
    }

    /// Picks up Pending and Running flows on every tick and drives each one
    /// on its own task. A flow is never driven twice at once.
    pub async fn watch(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut running = JoinSet::new();
        let mut ticker = tokio::time::interval(self.options.tick.max(MIN_TICK));
        info!("Flow scheduler started.");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let filter = FlowFilter {
                ids: None,
                states: Some(vec![FlowStatus::Pending, FlowStatus::Running]),
            };
            let flows = match list_all_flows(self.store.as_ref(), &filter).await {
                Ok(flows) => flows,
                Err(e) => {
                    error!(error = ?e, "Failed to list flows");
                    continue;
                }
            };

            for flow in flows {
                if !self.active.insert(flow.id.clone()) {
                    continue;
                }
                let scheduler = self.clone();
                let cancel = cancel.clone();
                running.spawn(async move {
                    if let Err(e) = scheduler.run_flow(&flow.id, &cancel).await {
                        error!(flow_id = %flow.id, error = ?e, "Flow run aborted");
                    }
                    scheduler.active.remove(&flow.id);
                });
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(error = ?e, "Flow run panicked");
                }
            }
        }

        info!(in_flight = running.len(), "Flow scheduler stopping.");
        while running.join_next().await.is_some() {}
        Ok(())
    }

    /// Runs one flow to a terminal state and returns it.
    ///
    /// Cancellation leaves the flow Running with its in-flight tasks
    /// recorded, so a later run resumes polling them.
    pub async fn run_flow(&self, flow_id: &str, cancel: &CancellationToken) -> Result<FlowStatus> {
        let mut flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| anyhow!("flow {} not found", flow_id))?;
        if flow.state.is_terminal() {
            return Ok(flow.state);
        }

        let loaded = list_all_tasks(self.store.as_ref(), &TaskFilter::by_flow(flow_id)).await?;
        let mut tasks: HashMap<String, Task> = loaded.into_iter().map(|t| (t.id.clone(), t)).collect();
        let order: Vec<String> = flow
            .task_ids
            .iter()
            .filter(|id| tasks.contains_key(*id))
            .cloned()
            .collect();
        if order.len() != flow.task_ids.len() {
            return Err(anyhow!("flow {} references tasks missing from the store", flow_id));
        }

        // Join counters: unmet dependencies per task.
        let mut waiting_on: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            let unmet = task
                .depend_on
                .iter()
                .filter(|dep| tasks.get(*dep).is_none_or(|d| d.state != TaskStatus::Success))
                .count();
            waiting_on.insert(task.id.clone(), unmet);
            for dep in &task.depend_on {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        let mut in_flight: HashMap<String, Dispatch> = HashMap::new();
        let mut failed = false;
        for task in tasks.values_mut() {
            match (task.state, task.instance_id.clone()) {
                (TaskStatus::Running, Some(instance_id)) => {
                    let deadline = Instant::now() + task_deadline(task);
                    in_flight.insert(task.id.clone(), Dispatch { instance_id, deadline });
                }
                // Marked Running but never handed to the queue.
                (TaskStatus::Running, None) => task.state = TaskStatus::Pending,
                (TaskStatus::Failed, _) => failed = true,
                _ => {}
            }
        }

        flow.state = FlowStatus::Running;
        self.store.update_flow(&flow).await?;
        info!(flow_id = %flow.id, flow_name = %flow.name, tasks = order.len(), "Running flow");

        let fail_fast = self.options.failure_policy == FailurePolicy::FailFast;
        loop {
            if !(failed && fail_fast) {
                let ready: Vec<String> = order
                    .iter()
                    .filter(|id| {
                        tasks.get(*id).is_some_and(|t| t.state == TaskStatus::Pending)
                            && waiting_on.get(*id).copied().unwrap_or(0) == 0
                    })
                    .cloned()
                    .collect();

                let mut changed = Vec::new();
                for id in ready {
                    let Some(task) = tasks.get_mut(&id) else { continue };
                    match self.adapter.send_task(task_signature(&flow, task)).await {
                        Ok(instance_id) => {
                            debug!(flow_id = %flow.id, task_id = %task.id, instance_id = %instance_id, "Task dispatched");
                            task.state = TaskStatus::Running;
                            task.instance_id = Some(instance_id.clone());
                            in_flight.insert(
                                id.clone(),
                                Dispatch {
                                    instance_id,
                                    deadline: Instant::now() + task_deadline(task),
                                },
                            );
                        }
                        Err(e) => {
                            warn!(flow_id = %flow.id, task_id = %task.id, error = %e, "Task dispatch rejected");
                            task.state = TaskStatus::Failed;
                            task.reason = Some(e.to_string());
                            failed = true;
                        }
                    }
                    changed.push(task.clone());
                }
                if !changed.is_empty() {
                    self.store.update_tasks(&changed).await?;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(flow_id = %flow.id, "Flow run cancelled");
                    return Err(anyhow!("run of flow {} was cancelled", flow.id));
                }
                _ = tokio::time::sleep(self.options.dispatch_poll) => {}
            }

            let mut changed = Vec::new();
            let mut share_changed = false;
            let mut settled = Vec::new();
            for (task_id, dispatch) in &in_flight {
                let state = self.adapter.task_state(&dispatch.instance_id).await?;
                let Some(task) = tasks.get_mut(task_id) else { continue };
                match state {
                    Some(s) if s.state == SignatureStatus::Success => {
                        task.state = TaskStatus::Success;
                        task.result = s.result;
                        for (k, v) in s.share_data {
                            share_changed |= flow.share_data.insert(k, v.clone()).as_ref() != Some(&v);
                        }
                        for next in dependents.get(task_id).into_iter().flatten() {
                            if let Some(n) = waiting_on.get_mut(next) {
                                *n = n.saturating_sub(1);
                            }
                        }
                    }
                    Some(s) if s.state == SignatureStatus::Failure => {
                        task.state = TaskStatus::Failed;
                        task.reason = Some(s.error.unwrap_or_else(|| "task failed".to_string()));
                        failed = true;
                    }
                    _ if Instant::now() >= dispatch.deadline => {
                        task.state = TaskStatus::Failed;
                        task.reason = Some(TASK_TIMEOUT_REASON.to_string());
                        failed = true;
                    }
                    _ => continue,
                }
                info!(flow_id = %flow.id, task_id = %task.id, state = ?task.state, "Task settled");
                changed.push(task.clone());
                settled.push(task_id.clone());
            }
            for id in settled {
                in_flight.remove(&id);
            }
            if share_changed {
                self.store.update_flow(&flow).await?;
            }
            if !changed.is_empty() {
                self.store.update_tasks(&changed).await?;
            }
        }

        flow.state = FlowStatus::derive(order.iter().filter_map(|id| tasks.get(id)).map(|t| t.state));
        flow.reason = order
            .iter()
            .filter_map(|id| tasks.get(id))
            .find(|t| t.state == TaskStatus::Failed)
            .map(|t| {
                format!(
                    "task {} ({}) failed: {}",
                    t.id,
                    t.action_name,
                    t.reason.as_deref().unwrap_or("unknown reason")
                )
            });
        self.store.update_flow(&flow).await?;
        info!(flow_id = %flow.id, state = ?flow.state, "Flow finished");
        Ok(flow.state)
    }
}

/// `timeout_secs` per attempt, capped at [`MAX_TASK_DEADLINE`].
fn task_deadline(task: &Task) -> Duration {
    let attempts = task.retry_count.saturating_add(1);
    Duration::from_secs(task.timeout_secs.max(1))
        .checked_mul(attempts)
        .map_or(MAX_TASK_DEADLINE, |d| d.min(MAX_TASK_DEADLINE))
}

fn subtask_signature(sub: &SubTask) -> Signature {
    let args = if sub.params.is_null() {
        vec![]
    } else {
        vec![Arg::json(sub.params.clone())]
    };
    Signature::new(sub.action_name.clone(), args)
}

fn task_signature(flow: &Flow, task: &Task) -> Signature {
    let args = if task.params.is_null() {
        vec![]
    } else {
        vec![Arg::json(task.params.clone())]
    };
    let mut sig = Signature::new(task.action_name.clone(), args)
        .with_retry(task.retry_count)
        .immutable();
    sig.timeout_secs = Some(task.timeout_secs);
    sig.headers.insert(FLOW_ID_HEADER.to_string(), flow.id.clone());
    for (k, v) in &flow.share_data {
        sig.headers.insert(format!("{SHARE_HEADER_PREFIX}{k}"), v.clone());
    }
    sig.on_success = task.on_success.iter().map(subtask_signature).collect();
    sig.on_error = task.on_error.iter().map(subtask_signature).collect();
    sig
}
