use anyhow::{Result, anyhow};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;

use crate::flow::model::{Flow, FlowStatus, Task};
use crate::flow::store::{FlowFilter, FlowStore, Page, TaskFilter, format_id};

const FLOW_STATES: [FlowStatus; 4] = [
    FlowStatus::Pending,
    FlowStatus::Running,
    FlowStatus::Success,
    FlowStatus::Failed,
];

/// Flows and tasks as JSON values of two Redis hashes keyed by id.
///
/// Two set indexes sit beside the hashes: task ids per flow and flow ids per
/// state. Writes update them in the same MULTI as the hash, and a created flow
/// joins its state set once HSETNX succeeds. Listing by flow or by state reads
/// only the matching ids.
pub struct RedisFlowStore {
    client: redis::Client,
    prefix: String,
}

impl RedisFlowStore {
    pub fn new(client: redis::Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn id_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    fn flows_key(&self) -> String {
        format!("{}:flows", self.prefix)
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn flow_tasks_key(&self, flow_id: &str) -> String {
        format!("{}:flow_tasks:{}", self.prefix, flow_id)
    }

    fn flow_state_key(&self, state: FlowStatus) -> String {
        let state = format!("{state:?}").to_lowercase();
        format!("{}:flow_state:{}", self.prefix, state)
    }

    async fn load<T: DeserializeOwned>(&self, key: String, id: &str) -> Result<Option<T>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.hget(key, id).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Values of `ids` in the given order. Ids absent from the hash are skipped.
    async fn load_many<T: DeserializeOwned>(
        conn: &mut MultiplexedConnection,
        key: &str,
        ids: &[String],
    ) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(ids.to_vec())
            .query_async(conn)
            .await?;
        let mut items = Vec::with_capacity(values.len());
        for value in values.into_iter().flatten() {
            items.push(serde_json::from_str(&value)?);
        }
        Ok(items)
    }

    async fn ensure_exist(conn: &mut MultiplexedConnection, key: &str, ids: &[&str]) -> Result<()> {
        for id in ids {
            let exists: bool = conn.hexists(key, *id).await?;
            if !exists {
                return Err(anyhow!("{} not found in {}", id, key));
            }
        }
        Ok(())
    }

    async fn write_tasks(&self, tasks: &[Task], must_exist: bool) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let key = self.tasks_key();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        if must_exist {
            let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
            Self::ensure_exist(&mut conn, &key, &ids).await?;
        }
        let mut pairs = Vec::with_capacity(tasks.len());
        for task in tasks {
            pairs.push((task.id.clone(), serde_json::to_string(task)?));
        }
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, &pairs).ignore();
        for task in tasks {
            pipe.sadd(self.flow_tasks_key(&task.flow_id), &task.id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Candidate ids in id order, plus whether every candidate is known to
    /// match so paging can happen before the values are read.
    async fn task_candidates(&self, conn: &mut MultiplexedConnection, filter: &TaskFilter) -> Result<(Vec<String>, bool)> {
        let mut ids: Vec<String> = match (&filter.ids, &filter.flow_id) {
            (Some(ids), _) => ids.clone(),
            (None, Some(flow_id)) => conn.smembers(self.flow_tasks_key(flow_id)).await?,
            (None, None) => conn.hkeys(self.tasks_key()).await?,
        };
        ids.sort();
        ids.dedup();
        let exact = filter.ids.is_none() && filter.action_name.is_none() && filter.states.is_none();
        Ok((ids, exact))
    }

    async fn flow_candidates(&self, conn: &mut MultiplexedConnection, filter: &FlowFilter) -> Result<(Vec<String>, bool)> {
        let mut ids: Vec<String> = match (&filter.ids, &filter.states) {
            (Some(ids), _) => ids.clone(),
            (None, Some(states)) if states.is_empty() => Vec::new(),
            (None, Some(states)) => {
                let keys: Vec<String> = states.iter().map(|s| self.flow_state_key(*s)).collect();
                conn.sunion(keys).await?
            }
            (None, None) => conn.hkeys(self.flows_key()).await?,
        };
        ids.sort();
        ids.dedup();
        Ok((ids, filter.ids.is_none()))
    }
}

fn page_of(ids: Vec<String>, page: Page) -> Vec<String> {
    ids.into_iter().skip(page.start).take(page.limit).collect()
}

#[async_trait]
impl FlowStore for RedisFlowStore {
    async fn allocate_ids(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let end: u64 = conn.incr(self.id_key(), count as u64).await?;
        let start = end + 1 - count as u64;
        Ok((start..=end).map(format_id).collect())
    }

    async fn create_flow(&self, flow: Flow) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let created: bool = conn
            .hset_nx(self.flows_key(), &flow.id, serde_json::to_string(&flow)?)
            .await?;
        if !created {
            return Err(anyhow!("flow {} already exists", flow.id));
        }
        let _: () = conn.sadd(self.flow_state_key(flow.state), &flow.id).await?;
        Ok(())
    }

    async fn create_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        self.write_tasks(&tasks, false).await
    }

    async fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        self.load(self.flows_key(), id).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.load(self.tasks_key(), id).await
    }

    async fn list_flows(&self, filter: &FlowFilter, page: Page) -> Result<Vec<Flow>> {
        page.validate()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (ids, exact) = self.flow_candidates(&mut conn, filter).await?;
        if exact {
            return Self::load_many(&mut conn, &self.flows_key(), &page_of(ids, page)).await;
        }
        let flows: Vec<Flow> = Self::load_many(&mut conn, &self.flows_key(), &ids).await?;
        Ok(flows
            .into_iter()
            .filter(|f| filter.matches(f))
            .skip(page.start)
            .take(page.limit)
            .collect())
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<Vec<Task>> {
        page.validate()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (ids, exact) = self.task_candidates(&mut conn, filter).await?;
        if exact {
            return Self::load_many(&mut conn, &self.tasks_key(), &page_of(ids, page)).await;
        }
        let tasks: Vec<Task> = Self::load_many(&mut conn, &self.tasks_key(), &ids).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| filter.matches(t))
            .skip(page.start)
            .take(page.limit)
            .collect())
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        let key = self.flows_key();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Self::ensure_exist(&mut conn, &key, &[flow.id.as_str()]).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().hset(&key, &flow.id, serde_json::to_string(flow)?).ignore();
        for state in FLOW_STATES.into_iter().filter(|s| *s != flow.state) {
            pipe.srem(self.flow_state_key(state), &flow.id).ignore();
        }
        pipe.sadd(self.flow_state_key(flow.state), &flow.id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn update_tasks(&self, tasks: &[Task]) -> Result<()> {
        self.write_tasks(tasks, true).await
    }
}
