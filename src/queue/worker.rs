use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::TaskContext;
use crate::queue::adapter::enqueue;
use crate::queue::broker::{ResultBackend, TaskQueue};
use crate::queue::signature::{Arg, Signature, SignatureState, SignatureStatus};
use crate::registry::{HandlerMap, TaskRegistry};

/// Whether a fan-in callback runs when some group members failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackPolicy {
    /// Callback runs only if every member succeeded; otherwise it never runs.
    #[default]
    AllSucceeded,
    /// Callback runs once every member is terminal, whatever the outcome.
    AllTerminal,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// Applied when a signature carries no `timeout_secs`.
    pub task_timeout: Duration,
    pub retry_delay: Duration,
    pub callback_policy: CallbackPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            task_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_millis(200),
            callback_policy: CallbackPolicy::default(),
        }
    }
}

/// Consumes signatures from the queue and runs the registered handlers.
///
/// Handlers are snapshotted from the registry when the worker is built, so
/// registration must be complete before the worker starts.
pub struct Worker {
    name: String,
    queue: Arc<dyn TaskQueue>,
    backend: Arc<dyn ResultBackend>,
    handlers: HandlerMap,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        registry: &TaskRegistry,
        namespace: &str,
        queue: Arc<dyn TaskQueue>,
        backend: Arc<dyn ResultBackend>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            backend,
            handlers: registry.all_handlers(namespace),
            options,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut running = JoinSet::new();
        info!(worker = %self.name, handlers = self.handlers.len(), "Worker started.");

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.pop() => next,
            };

            match next {
                Ok(Some(sig)) => {
                    let worker = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        let task_id = sig.uuid.clone();
                        if let Err(e) = worker.process(sig).await {
                            error!(task_id = %task_id, error = ?e, "Failed to record task outcome");
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.name, error = ?e, "Failed to pop from task queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(worker = %self.name, error = ?e, "Task execution panicked");
                }
            }
        }

        info!(worker = %self.name, in_flight = running.len(), "Worker stopping.");
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(worker = %self.name, error = ?e, "Task execution panicked");
            }
        }
        Ok(())
    }

    /// Runs one signature to its next state: Success, Failure, or re-enqueued for retry.
    pub async fn process(&self, mut sig: Signature) -> Result<()> {
        let attempt = match self.backend.get_state(&sig.uuid).await? {
            Some(prior) => prior.attempts + 1,
            None => 1,
        };

        let Some(handler) = self.handlers.get(&sig.task_name).cloned() else {
            let reason = format!("task '{}' is not registered", sig.task_name);
            warn!(task_id = %sig.uuid, "{}", reason);
            return self.finish_failed(sig, reason, attempt).await;
        };

        let mut state = SignatureState::new(&sig, SignatureStatus::Received);
        state.attempts = attempt;
        self.backend.set_state(state.clone()).await?;
        state.state = SignatureStatus::Started;
        self.backend.set_state(state).await?;

        let ctx = TaskContext::from_signature(&sig, attempt);
        let limit = sig
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.options.task_timeout);
        debug!(task_id = %sig.uuid, task_name = %sig.task_name, attempt, "executing task");

        let outcome = match timeout(limit, handler.execute(&ctx, sig.args.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!("task timed out after {:?}", limit)),
        };

        match outcome {
            Ok(result) => self.finish_succeeded(sig, &ctx, result, attempt).await,
            Err(e) if sig.retry_count > 0 => {
                let reason = format!("{e:#}");
                warn!(task_id = %sig.uuid, attempt, retries_left = sig.retry_count - 1, error = %reason, "Task failed, retrying");
                let mut state = SignatureState::new(&sig, SignatureStatus::Retry);
                state.attempts = attempt;
                state.error = Some(reason);
                self.backend.set_state(state).await?;
                sig.retry_count -= 1;
                tokio::time::sleep(self.options.retry_delay).await;
                self.queue.push(sig).await
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(task_id = %sig.uuid, task_name = %sig.task_name, error = %reason, "Task failed");
                self.finish_failed(sig, reason, attempt).await
            }
        }
    }

    async fn finish_succeeded(
        &self,
        sig: Signature,
        ctx: &TaskContext,
        result: Value,
        attempt: u32,
    ) -> Result<()> {
        let mut state = SignatureState::new(&sig, SignatureStatus::Success);
        state.attempts = attempt;
        state.result = Some(result.clone());
        state.share_data = ctx.share_snapshot();
        self.backend.set_state(state).await?;

        for mut next in sig.on_success.iter().cloned() {
            if !next.immutable {
                next.args.insert(0, Arg::json(result.clone()));
            }
            inherit_headers(&sig, &mut next);
            enqueue(self.queue.as_ref(), self.backend.as_ref(), next).await?;
        }
        self.maybe_fire_chord(&sig).await
    }

    async fn finish_failed(&self, sig: Signature, reason: String, attempt: u32) -> Result<()> {
        let mut state = SignatureState::new(&sig, SignatureStatus::Failure);
        state.attempts = attempt;
        state.error = Some(reason.clone());
        self.backend.set_state(state).await?;

        for mut next in sig.on_error.iter().cloned() {
            if !next.immutable {
                next.args.insert(0, Arg::string(reason.clone()));
            }
            inherit_headers(&sig, &mut next);
            enqueue(self.queue.as_ref(), self.backend.as_ref(), next).await?;
        }
        self.maybe_fire_chord(&sig).await
    }

    async fn maybe_fire_chord(&self, sig: &Signature) -> Result<()> {
        let Some(callback) = sig.chord_callback.as_deref() else {
            return Ok(());
        };
        if sig.group_uuid.is_empty() {
            return Ok(());
        }

        let members = self
            .backend
            .group_members(&sig.group_uuid)
            .await?
            .ok_or_else(|| anyhow!("group {} not found", sig.group_uuid))?;
        let mut results = Vec::with_capacity(members.len());
        let mut all_succeeded = true;
        for id in &members {
            match self.backend.get_state(id).await? {
                Some(state) if state.is_terminal() => {
                    all_succeeded &= state.state == SignatureStatus::Success;
                    results.push(state.result.unwrap_or(Value::Null));
                }
                _ => return Ok(()),
            }
        }

        if !all_succeeded && self.options.callback_policy == CallbackPolicy::AllSucceeded {
            info!(group_id = %sig.group_uuid, callback_id = %callback.uuid, "Group had failures, chord callback will not run");
            return Ok(());
        }
        if !self.backend.trigger_chord(&sig.group_uuid).await? {
            return Ok(());
        }

        let mut callback = callback.clone();
        if !callback.immutable {
            callback.args.insert(0, Arg::json(Value::Array(results)));
        }
        info!(group_id = %sig.group_uuid, callback_id = %callback.uuid, "Dispatching chord callback");
        enqueue(self.queue.as_ref(), self.backend.as_ref(), callback).await
    }
}

fn inherit_headers(parent: &Signature, child: &mut Signature) {
    for (k, v) in &parent.headers {
        child.headers.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
