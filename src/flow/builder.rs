use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::error::BuildError;
use crate::flow::model::{Flow, FlowStatus, Task, TaskStatus};
use crate::flow::store::FlowStore;
use crate::flow::template::{FlowTemplate, ParamOverrides, TemplateStep, validate_steps};

/// Instantiates fixed topologies into persisted Flows.
pub struct FlowBuilder {
    store: Arc<dyn FlowStore>,
}

impl FlowBuilder {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    pub async fn build_from_template(
        &self,
        template: &FlowTemplate,
        overrides: &ParamOverrides,
        share_data: BTreeMap<String, String>,
    ) -> Result<Flow, BuildError> {
        let mut steps = template.steps.clone();
        overrides.apply(&mut steps)?;
        self.build_from_steps(&template.name, steps, share_data).await
    }

    /// Builds from a caller-supplied step list.
    ///
    /// One id call covers the flow plus every task; the returned count must
    /// match exactly. Tasks are persisted in a single call before the flow
    /// record, so a visible flow always has its tasks.
    pub async fn build_from_steps(
        &self,
        name: &str,
        steps: Vec<TemplateStep>,
        share_data: BTreeMap<String, String>,
    ) -> Result<Flow, BuildError> {
        validate_steps(&steps, name)?;

        let expected = steps.len() + 1;
        let ids = self
            .store
            .allocate_ids(expected)
            .await
            .map_err(BuildError::Store)?;
        if ids.len() != expected {
            return Err(BuildError::IdCountMismatch {
                expected,
                got: ids.len(),
            });
        }
        let (flow_id, task_ids) = ids.split_first().ok_or(BuildError::IdCountMismatch {
            expected,
            got: 0,
        })?;

        let by_key: HashMap<&str, &str> = steps
            .iter()
            .zip(task_ids)
            .map(|(s, id)| (s.key.as_str(), id.as_str()))
            .collect();

        let mut tasks = Vec::with_capacity(steps.len());
        for (step, id) in steps.iter().zip(task_ids) {
            let mut depend_on = Vec::with_capacity(step.depend_on.len());
            for dep in &step.depend_on {
                let Some(dep_id) = by_key.get(dep.as_str()) else {
                    return Err(BuildError::UnknownDependency {
                        step: step.key.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !depend_on.iter().any(|d: &String| d == dep_id) {
                    depend_on.push(dep_id.to_string());
                }
            }
            tasks.push(Task {
                id: id.clone(),
                flow_id: flow_id.clone(),
                flow_name: name.to_string(),
                action_name: step.action_name.clone(),
                params: step.params.clone(),
                retry_count: step.retry_count,
                timeout_secs: step.timeout_secs,
                depend_on,
                state: TaskStatus::Pending,
                result: None,
                reason: None,
                on_success: step.on_success.clone(),
                on_error: step.on_error.clone(),
                instance_id: None,
            });
        }

        let flow = Flow {
            id: flow_id.clone(),
            name: name.to_string(),
            state: FlowStatus::Pending,
            task_ids: task_ids.to_vec(),
            reason: None,
            share_data,
        };

        self.store
            .create_tasks(tasks)
            .await
            .map_err(BuildError::Store)?;
        self.store
            .create_flow(flow.clone())
            .await
            .map_err(BuildError::Store)?;
        info!(flow_id = %flow.id, flow_name = %flow.name, tasks = flow.task_ids.len(), "Flow created");
        Ok(flow)
    }
}
