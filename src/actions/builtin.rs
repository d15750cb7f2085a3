use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::actions::{TaskContext, TaskHandler};
use crate::queue::signature::Arg;
use crate::registry::TaskRegistry;

#[derive(Debug)]
pub struct LogAction;

#[async_trait]
impl TaskHandler for LogAction {
    async fn execute(&self, ctx: &TaskContext, args: Vec<Arg>) -> Result<Value> {
        let values: Vec<&Value> = args.iter().map(|a| &a.value).collect();
        match values.first().and_then(|v| v.get("msg")).and_then(|v| v.as_str()) {
            Some(msg) => info!(task_id = %ctx.task_id, flow_id = ?ctx.flow_id, "[LOG] {}", msg),
            None => info!(task_id = %ctx.task_id, flow_id = ?ctx.flow_id, "[LOG] {:?}", values),
        }
        Ok(Value::Null)
    }
}

/// Returns its first argument unchanged. Useful as a chain pass-through.
#[derive(Debug)]
pub struct EchoAction;

#[async_trait]
impl TaskHandler for EchoAction {
    async fn execute(&self, _ctx: &TaskContext, args: Vec<Arg>) -> Result<Value> {
        Ok(args.into_iter().next().map(|a| a.value).unwrap_or(Value::Null))
    }
}

/// Registers the handlers every process ships with.
pub fn register_builtins(registry: &TaskRegistry, namespace: &str) {
    registry.register(namespace, "log", Arc::new(LogAction));
    registry.register(namespace, "echo", Arc::new(EchoAction));
    registry.register(namespace, "http", Arc::new(crate::actions::http::HttpAction::new()));
}
