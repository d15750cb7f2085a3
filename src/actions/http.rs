use std::fmt::Debug;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::actions::{TaskContext, TaskHandler};
use crate::queue::signature::Arg;

/// Issues one JSON HTTP request described by the first argument:
/// `{"url": ..., "method": "POST", "body": {...}, "headers": {...}}`.
///
/// Non-2xx responses fail the task so the queue's retry budget applies.
#[derive(Debug)]
pub struct HttpAction {
    client: Client,
}

impl HttpAction {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpAction {
    fn default() -> Self {
        Self::new()
    }
}

fn request_params(args: &[Arg]) -> Result<&Value> {
    args.first()
        .map(|a| &a.value)
        .ok_or_else(|| anyhow!("Missing request argument"))
}

#[async_trait]
impl TaskHandler for HttpAction {
    fn validate(&self, args: &[Arg]) -> Result<()> {
        let params = request_params(args)?;
        if params.get("url").and_then(|v| v.as_str()).is_none() {
            return Err(anyhow!("Missing required parameter: url"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext, args: Vec<Arg>) -> Result<Value> {
        let params = request_params(&args)?;
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Invalid url"))?;

        let method_str = params.get("method").and_then(|v| v.as_str()).unwrap_or("GET");
        let method = method_str
            .parse::<reqwest::Method>()
            .map_err(|_| anyhow!("Invalid HTTP method: {}", method_str))?;

        let mut builder = self
            .client
            .request(method, url)
            .header("X-Request-Id", ctx.task_id.as_str());

        if let Some(body) = params.get("body") {
            builder = builder.json(body);
        }

        if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v_str) = v.as_str() {
                    builder = builder.header(k, v_str);
                }
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        let data = response.json::<Value>().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(anyhow!("{} {} returned {}: {}", method_str, url, status, data));
        }

        Ok(json!({
            "status": status.as_u16(),
            "data": data
        }))
    }
}
