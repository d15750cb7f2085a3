use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::flow::model::{Flow, FlowStatus, Task, TaskStatus};

/// Largest page any list call accepts.
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub start: usize,
    pub limit: usize,
}

impl Page {
    pub fn first() -> Self {
        Self {
            start: 0,
            limit: MAX_PAGE_LIMIT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(anyhow!("page limit must be within 1..={}", MAX_PAGE_LIMIT));
        }
        Ok(())
    }

    pub fn next(self) -> Self {
        Self {
            start: self.start + self.limit,
            limit: self.limit,
        }
    }

    fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().skip(self.start).take(self.limit).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub ids: Option<Vec<String>>,
    pub states: Option<Vec<FlowStatus>>,
}

impl FlowFilter {
    pub fn matches(&self, flow: &Flow) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&flow.id))
            && self.states.as_ref().is_none_or(|s| s.contains(&flow.state))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub ids: Option<Vec<String>>,
    pub flow_id: Option<String>,
    pub action_name: Option<String>,
    pub states: Option<Vec<TaskStatus>>,
}

impl TaskFilter {
    pub fn by_flow(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: Some(flow_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&task.id))
            && self.flow_id.as_ref().is_none_or(|f| *f == task.flow_id)
            && self.action_name.as_ref().is_none_or(|a| *a == task.action_name)
            && self.states.as_ref().is_none_or(|s| s.contains(&task.state))
    }
}

/// Durable home of Flows and Tasks.
///
/// Ids are zero-padded decimal strings, so lexical order is allocation order;
/// list calls return records in that order.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Reserves `count` fresh ids in one call.
    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>>;

    async fn create_flow(&self, flow: Flow) -> Result<()>;
    async fn create_tasks(&self, tasks: Vec<Task>) -> Result<()>;

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>>;
    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<Vec<Task>>;

    async fn update_flow(&self, flow: &Flow) -> Result<()>;
    async fn update_tasks(&self, tasks: &[Task]) -> Result<()>;
}

pub fn format_id(n: u64) -> String {
    format!("{:012}", n)
}

/// Drains every page matching `filter`.
pub async fn list_all_flows(store: &dyn FlowStore, filter: &FlowFilter) -> Result<Vec<Flow>> {
    let mut flows = Vec::new();
    let mut page = Page::first();
    loop {
        let batch = store.list_flows(filter, page).await?;
        let len = batch.len();
        flows.extend(batch);
        if len < page.limit {
            break;
        }
        page = page.next();
    }
    Ok(flows)
}

pub async fn list_all_tasks(store: &dyn FlowStore, filter: &TaskFilter) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut page = Page::first();
    loop {
        let batch = store.list_tasks(filter, page).await?;
        let len = batch.len();
        tasks.extend(batch);
        if len < page.limit {
            break;
        }
        page = page.next();
    }
    Ok(tasks)
}

// --- In-Memory Implementation ---

#[derive(Default)]
pub struct InMemoryFlowStore {
    next_id: AtomicU64,
    flows: DashMap<String, Flow>,
    tasks: DashMap<String, Task>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>> {
        let start = self.next_id.fetch_add(count as u64, Ordering::SeqCst) + 1;
        Ok((start..start + count as u64).map(format_id).collect())
    }

    async fn create_flow(&self, flow: Flow) -> Result<()> {
        if self.flows.contains_key(&flow.id) {
            return Err(anyhow!("flow {} already exists", flow.id));
        }
        self.flows.insert(flow.id.clone(), flow);
        Ok(())
    }

    async fn create_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        if let Some(dup) = tasks.iter().find(|t| self.tasks.contains_key(&t.id)) {
            return Err(anyhow!("task {} already exists", dup.id));
        }
        for task in tasks {
            self.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        Ok(self.flows.get(id).map(|f| f.value().clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.value().clone()))
    }

    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>> {
        page.validate()?;
        let mut flows: Vec<Flow> = self
            .flows
            .iter()
            .filter(|f| filter.matches(f.value()))
            .map(|f| f.value().clone())
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(page.slice(flows))
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<Vec<Task>> {
        page.validate()?;
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| filter.matches(t.value()))
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(page.slice(tasks))
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        match self.flows.get_mut(&flow.id) {
            Some(mut existing) => {
                *existing = flow.clone();
                Ok(())
            }
            None => Err(anyhow!("flow {} not found", flow.id)),
        }
    }

    async fn update_tasks(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            match self.tasks.get_mut(&task.id) {
                Some(mut existing) => *existing = task.clone(),
                None => return Err(anyhow!("task {} not found", task.id)),
            }
        }
        Ok(())
    }
}
