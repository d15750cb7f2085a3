use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::queue::broker::{ResultBackend, TaskQueue};
use crate::queue::signature::{Signature, SignatureState};

pub struct RedisTaskQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisTaskQueue {
    pub fn new(client: redis::Client, queue_key: String) -> Self {
        Self { client, queue_key }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, sig: Signature) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&sig)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Signature>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 1s block keeps the worker responsive to shutdown.
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        match result {
            Some((_, sig_json)) => Ok(Some(serde_json::from_str(&sig_json)?)),
            None => Ok(None),
        }
    }
}

pub struct RedisResultBackend {
    client: redis::Client,
    prefix: String,
    /// Seconds a terminal state is kept before Redis expires it.
    result_ttl_secs: u64,
}

impl RedisResultBackend {
    pub fn new(client: redis::Client, prefix: String, result_ttl_secs: u64) -> Self {
        Self {
            client,
            prefix,
            result_ttl_secs,
        }
    }

    fn state_key(&self, task_uuid: &str) -> String {
        format!("{}:state:{}", self.prefix, task_uuid)
    }

    fn group_key(&self, group_uuid: &str) -> String {
        format!("{}:group:{}", self.prefix, group_uuid)
    }

    fn chord_key(&self, group_uuid: &str) -> String {
        format!("{}:chord:{}", self.prefix, group_uuid)
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn set_state(&self, state: SignatureState) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.state_key(&state.task_uuid);
        let serialized = serde_json::to_string(&state)?;
        if state.is_terminal() && self.result_ttl_secs > 0 {
            let _: () = conn.set_ex(key, serialized, self.result_ttl_secs).await?;
        } else {
            let _: () = conn.set(key, serialized).await?;
        }
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> Result<Option<SignatureState>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.state_key(task_uuid)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(task_uuids)?;
        let _: () = conn.set(self.group_key(group_uuid), serialized).await?;
        Ok(())
    }

    async fn group_members(&self, group_uuid: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.group_key(group_uuid)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool> {
        // SET NX plus EXPIRE, atomically.
        let script = redis::Script::new(
            r#"
            if redis.call("SET", KEYS[1], "1", "NX") then
                local ttl = tonumber(ARGV[1])
                if ttl > 0 then
                    redis.call("EXPIRE", KEYS[1], ttl)
                end
                return 1
            end
            return 0
        "#,
        );
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let fired: i64 = script
            .key(self.chord_key(group_uuid))
            .arg(self.result_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(fired == 1)
    }
}
