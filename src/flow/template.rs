use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;
use crate::flow::model::SubTask;

fn default_timeout_secs() -> u64 {
    60
}

/// One node of a fixed flow topology. `depend_on` names other steps by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    pub key: String,
    pub action_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<SubTask>,
    #[serde(default)]
    pub on_error: Vec<SubTask>,
}

impl TemplateStep {
    pub fn new(key: impl Into<String>, action_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action_name: action_name.into(),
            params: Value::Null,
            retry_count: 0,
            timeout_secs: default_timeout_secs(),
            depend_on: Vec::new(),
            on_success: Vec::new(),
            on_error: Vec::new(),
        }
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depend_on.push(key.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<TemplateStep>,
}

impl FlowTemplate {
    /// Checks keys, dependency references and acyclicity. Returns step
    /// indices in a dependency-respecting order.
    pub fn validate(&self) -> Result<Vec<usize>, BuildError> {
        validate_steps(&self.steps, &self.name)
    }
}

pub(crate) fn validate_steps(steps: &[TemplateStep], name: &str) -> Result<Vec<usize>, BuildError> {
    if steps.is_empty() {
        return Err(BuildError::EmptyFlow(name.to_string()));
    }

    let mut index = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        if index.insert(step.key.as_str(), i).is_some() {
            return Err(BuildError::DuplicateStep(step.key.clone()));
        }
    }

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &step.depend_on {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(BuildError::UnknownDependency {
                    step: step.key.clone(),
                    dependency: dep.clone(),
                });
            };
            if seen.insert(d) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    // Kahn's algorithm; leftovers sit on a cycle.
    let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() != steps.len() {
        let cycle = (0..steps.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| steps[i].key.clone())
            .collect();
        return Err(BuildError::Cycle(cycle));
    }
    Ok(order)
}

/// Caller-supplied parameters keyed by action name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamOverrides {
    #[serde(default)]
    pub params: Vec<ActionParam>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub action_name: String,
    #[serde(default)]
    pub param: Value,
}

impl ParamOverrides {
    pub fn with(mut self, action_name: impl Into<String>, param: Value) -> Self {
        self.params.push(ActionParam {
            action_name: action_name.into(),
            param,
        });
        self
    }

    /// Merges every override into each step sharing its action name.
    /// Objects merge key by key; anything else replaces the template value.
    pub fn apply(&self, steps: &mut [TemplateStep]) -> Result<(), BuildError> {
        for over in &self.params {
            let mut matched = false;
            for step in steps.iter_mut().filter(|s| s.action_name == over.action_name) {
                merge_params(&mut step.params, &over.param);
                matched = true;
            }
            if !matched {
                return Err(BuildError::UnmatchedOverride(over.action_name.clone()));
            }
        }
        Ok(())
    }
}

fn merge_params(base: &mut Value, over: &Value) {
    match (base, over) {
        (Value::Object(base), Value::Object(over)) => {
            for (k, v) in over {
                base.insert(k.clone(), v.clone());
            }
        }
        (base, over) => *base = over.clone(),
    }
}

pub fn load_template_from_yaml(path: impl AsRef<Path>) -> Result<FlowTemplate> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read template from {}", path.display()))?;
    let template: FlowTemplate = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to deserialize template from {}", path.display()))?;
    template.validate()?;
    Ok(template)
}
