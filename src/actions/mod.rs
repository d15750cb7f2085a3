use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::queue::signature::{Arg, Signature};

pub mod builtin;
pub mod http;

/// Header carrying the owning flow id of a dispatched task.
pub const FLOW_ID_HEADER: &str = "flow_id";
/// Prefix of headers carrying flow share data.
pub const SHARE_HEADER_PREFIX: &str = "share.";

/// Executable unit of work. Implementations are registered under a
/// (namespace, name) pair in the [`TaskRegistry`](crate::registry::TaskRegistry).
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    /// Checked at submission time, before anything is enqueued.
    fn validate(&self, _args: &[Arg]) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext, args: Vec<Arg>) -> Result<Value>;
}

/// What a handler knows about the instance it is executing.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub task_name: String,
    pub flow_id: Option<String>,
    /// Starts at 1, incremented on every retry.
    pub attempt: u32,
    share_data: Arc<DashMap<String, String>>,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            flow_id: None,
            attempt: 1,
            share_data: Arc::new(DashMap::new()),
        }
    }

    pub fn from_signature(sig: &Signature, attempt: u32) -> Self {
        let mut ctx = Self::new(sig.uuid.clone(), sig.task_name.clone());
        ctx.attempt = attempt;
        ctx.flow_id = sig.headers.get(FLOW_ID_HEADER).cloned();
        for (k, v) in &sig.headers {
            if let Some(key) = k.strip_prefix(SHARE_HEADER_PREFIX) {
                ctx.share_data.insert(key.to_string(), v.clone());
            }
        }
        ctx
    }

    pub fn share(&self, key: &str) -> Option<String> {
        self.share_data.get(key).map(|v| v.value().clone())
    }

    pub fn set_share(&self, key: impl Into<String>, value: impl Into<String>) {
        self.share_data.insert(key.into(), value.into());
    }

    pub fn share_snapshot(&self) -> BTreeMap<String, String> {
        self.share_data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
