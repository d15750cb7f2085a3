use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::error::SubmissionError;
use crate::queue::broker::{ResultBackend, TaskQueue};
use crate::queue::signature::{
    Signature, SignatureState, SignatureStatus, SubmitRequest, SubmitResponse, TaskType,
    new_group_uuid,
};
use crate::registry::TaskRegistry;

/// Handle of a fan-in submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChordHandle {
    pub group_id: String,
    pub callback_id: String,
}

/// Snapshot of a fan-in: every member plus the callback, which is `None`
/// until it has been dispatched.
#[derive(Debug, Clone)]
pub struct ChordState {
    pub members: Vec<SignatureState>,
    pub callback: Option<SignatureState>,
}

/// Submits task graphs to the work queue and reads their state back.
///
/// Submission is all-or-nothing with respect to validation: a malformed
/// step, an unregistered task name or a serialization failure is reported
/// before anything is pushed.
pub struct QueueAdapter {
    queue: Arc<dyn TaskQueue>,
    backend: Arc<dyn ResultBackend>,
    registry: Arc<TaskRegistry>,
    namespace: String,
}

/// Records the instance as Pending and pushes it.
pub(crate) async fn enqueue(
    queue: &dyn TaskQueue,
    backend: &dyn ResultBackend,
    sig: Signature,
) -> Result<()> {
    backend
        .set_state(SignatureState::new(&sig, SignatureStatus::Pending))
        .await?;
    queue.push(sig).await
}

impl QueueAdapter {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        backend: Arc<dyn ResultBackend>,
        registry: Arc<TaskRegistry>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            backend,
            registry,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn check(&self, sig: &Signature, index: usize) -> Result<(), SubmissionError> {
        sig.validate(index)?;
        for name in sig.task_names() {
            if !self.registry.contains(&self.namespace, name) {
                return Err(SubmissionError::UnregisteredTask {
                    namespace: self.namespace.clone(),
                    name: name.to_string(),
                });
            }
        }
        if let Some(handler) = self.registry.handler(&self.namespace, &sig.task_name) {
            handler
                .validate(&sig.args)
                .map_err(|e| SubmissionError::InvalidArguments {
                    task_name: sig.task_name.clone(),
                    message: format!("{e:#}"),
                })?;
        }
        Ok(())
    }

    async fn publish_all(&self, sigs: Vec<Signature>) -> Result<(), SubmissionError> {
        // Serialize up front so an unencodable signature enqueues nothing.
        for sig in &sigs {
            serde_json::to_string(sig)?;
        }
        for sig in sigs {
            debug!(task_id = %sig.uuid, task_name = %sig.task_name, "enqueue signature");
            enqueue(self.queue.as_ref(), self.backend.as_ref(), sig)
                .await
                .map_err(SubmissionError::Broker)?;
        }
        Ok(())
    }

    /// Returns the instance id of the submitted task.
    pub async fn send_task(&self, mut sig: Signature) -> Result<String, SubmissionError> {
        self.check(&sig, 0)?;
        sig.assign_ids();
        let id = sig.uuid.clone();
        self.publish_all(vec![sig]).await?;
        info!(task_id = %id, "submitted task");
        Ok(id)
    }

    /// Returns the group id. Members run in no particular order.
    pub async fn send_group(&self, sigs: Vec<Signature>) -> Result<String, SubmissionError> {
        let (group_id, members) = self.prepare_group(sigs, None)?;
        self.register_group(&group_id, &members).await?;
        self.publish_all(members).await?;
        info!(group_id = %group_id, "submitted group");
        Ok(group_id)
    }

    /// Group plus a callback dispatched once every member is terminal.
    pub async fn send_chord(
        &self,
        sigs: Vec<Signature>,
        mut callback: Signature,
    ) -> Result<ChordHandle, SubmissionError> {
        self.check(&callback, 0)?;
        callback.assign_ids();
        let callback_id = callback.uuid.clone();
        let (group_id, members) = self.prepare_group(sigs, Some(callback))?;
        self.register_group(&group_id, &members).await?;
        self.publish_all(members).await?;
        info!(group_id = %group_id, callback_id = %callback_id, "submitted chord");
        Ok(ChordHandle {
            group_id,
            callback_id,
        })
    }

    /// Returns the id of the first task, which addresses the chain.
    /// Publishes a chain and returns the head id.
    pub async fn send_chain(&self, sigs: Vec<Signature>) -> Result<String, SubmissionError> {
        let ids = self.send_chain_ids(sigs).await?;
        ids.into_iter().next().ok_or(SubmissionError::EmptySteps)
    }

    /// Publishes a chain and returns every step id in order, for
    /// [`chain_states`](Self::chain_states).
    pub async fn send_chain_ids(&self, mut sigs: Vec<Signature>) -> Result<Vec<String>, SubmissionError> {
        if sigs.is_empty() {
            return Err(SubmissionError::EmptySteps);
        }
        for (i, sig) in sigs.iter_mut().enumerate() {
            self.check(sig, i)?;
            sig.assign_ids();
        }
        let ids: Vec<String> = sigs.iter().map(|s| s.uuid.clone()).collect();

        // Link back to front: step i+1 becomes an on-success branch of step i.
        let mut head: Option<Signature> = None;
        for mut sig in sigs.into_iter().rev() {
            if let Some(next) = head.take() {
                sig.on_success.push(next);
            }
            head = Some(sig);
        }
        let Some(head) = head else {
            return Err(SubmissionError::EmptySteps);
        };
        self.publish_all(vec![head]).await?;
        info!(task_id = %ids[0], steps = ids.len(), "submitted chain");
        Ok(ids)
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitResponse, SubmissionError> {
        req.validate()?;
        let task_type = req.task_type;
        match task_type {
            TaskType::Single => {
                let Some(step) = req.steps.into_iter().next() else {
                    return Err(SubmissionError::EmptySteps);
                };
                let task_id = self.send_task(step).await?;
                Ok(SubmitResponse {
                    task_type,
                    task_id: Some(task_id),
                    group_id: None,
                    chain_ids: Vec::new(),
                })
            }
            TaskType::Chain => {
                let chain_ids = self.send_chain_ids(req.steps).await?;
                Ok(SubmitResponse {
                    task_type,
                    task_id: chain_ids.first().cloned(),
                    group_id: None,
                    chain_ids,
                })
            }
            TaskType::Group => {
                let group_id = self.send_group(req.steps).await?;
                Ok(SubmitResponse {
                    task_type,
                    task_id: None,
                    group_id: Some(group_id),
                    chain_ids: Vec::new(),
                })
            }
            TaskType::Chord => {
                let callback = req.callback_task.ok_or(SubmissionError::MissingCallback)?;
                let handle = self.send_chord(req.steps, callback).await?;
                Ok(SubmitResponse {
                    task_type,
                    task_id: None,
                    group_id: Some(handle.group_id),
                    chain_ids: Vec::new(),
                })
            }
            TaskType::Cron => Err(SubmissionError::Unsupported(TaskType::Cron)),
        }
    }

    fn prepare_group(
        &self,
        sigs: Vec<Signature>,
        callback: Option<Signature>,
    ) -> Result<(String, Vec<Signature>), SubmissionError> {
        if sigs.is_empty() {
            return Err(SubmissionError::EmptySteps);
        }
        let group_id = new_group_uuid();
        let count = sigs.len();
        let mut members = Vec::with_capacity(count);
        for (i, mut sig) in sigs.into_iter().enumerate() {
            self.check(&sig, i)?;
            sig.assign_ids();
            sig.group_uuid = group_id.clone();
            sig.group_task_count = count;
            sig.chord_callback = callback.clone().map(Box::new);
            members.push(sig);
        }
        Ok((group_id, members))
    }

    async fn register_group(
        &self,
        group_id: &str,
        members: &[Signature],
    ) -> Result<(), SubmissionError> {
        let ids: Vec<String> = members.iter().map(|m| m.uuid.clone()).collect();
        self.backend
            .init_group(group_id, &ids)
            .await
            .map_err(SubmissionError::Broker)
    }

    // --- State queries (read-only) ---

    /// `None` means the instance was never dispatched.
    pub async fn task_state(&self, task_id: &str) -> Result<Option<SignatureState>> {
        self.backend.get_state(task_id).await
    }

    pub async fn group_states(
        &self,
        group_id: &str,
        expected_count: usize,
    ) -> Result<Vec<SignatureState>> {
        let members = self
            .backend
            .group_members(group_id)
            .await?
            .ok_or_else(|| anyhow!("group {} not found", group_id))?;
        if members.len() != expected_count {
            return Err(anyhow!(
                "group {} has {} members, expected {}",
                group_id,
                members.len(),
                expected_count
            ));
        }
        let mut states = Vec::with_capacity(members.len());
        for id in members {
            let state = match self.backend.get_state(&id).await? {
                Some(state) => state,
                None => SignatureState::pending(id),
            };
            states.push(state);
        }
        Ok(states)
    }

    /// One entry per id, in order; `None` marks a step that never ran.
    pub async fn chain_states(&self, task_ids: &[String]) -> Result<Vec<Option<SignatureState>>> {
        let mut states = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            states.push(self.backend.get_state(id).await?);
        }
        Ok(states)
    }

    pub async fn chord_states(&self, group_id: &str, callback_id: &str) -> Result<ChordState> {
        let members = self
            .backend
            .group_members(group_id)
            .await?
            .ok_or_else(|| anyhow!("group {} not found", group_id))?;
        let count = members.len();
        Ok(ChordState {
            members: self.group_states(group_id, count).await?,
            callback: self.backend.get_state(callback_id).await?,
        })
    }
}
