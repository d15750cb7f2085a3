use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::flow::scheduler::{FailurePolicy, SchedulerOptions};
use crate::poller::PollOptions;
use crate::queue::{CallbackPolicy, WorkerOptions};
use crate::wait::{CoordinatorOptions, WaitOptions};

/// Process configuration, loaded from YAML. Every section and field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
    pub wait: WaitConfig,
    pub poller: PollerConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Rejects settings the loops cannot run with: zero intervals and zero
    /// concurrency.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("worker.concurrency", self.worker.concurrency as u64),
            ("scheduler.tick_ms", self.scheduler.tick_ms),
            ("scheduler.dispatch_poll_ms", self.scheduler.dispatch_poll_ms),
            ("coordinator.tick_secs", self.coordinator.tick_secs),
            ("coordinator.tenant_concurrency", self.coordinator.tenant_concurrency as u64),
            ("wait.interval_ms", self.wait.interval_ms),
            ("wait.timeout_secs", self.wait.timeout_secs),
            ("poller.interval_ms", self.poller.interval_ms),
            ("poller.timeout_secs", self.poller.timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                bail!("{} must be greater than zero", field);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub queue_key: String,
    pub key_prefix: String,
    /// Seconds terminal task states are kept; 0 keeps them forever.
    pub result_ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            queue_key: "cumulus:tasks".to_string(),
            key_prefix: "cumulus".to_string(),
            result_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub namespace: String,
    pub concurrency: usize,
    pub task_timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub callback_policy: CallbackPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            concurrency: 8,
            task_timeout_secs: 60,
            retry_delay_ms: 200,
            callback_policy: CallbackPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            callback_policy: self.callback_policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub dispatch_poll_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            dispatch_poll_ms: 100,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            failure_policy: self.failure_policy,
            dispatch_poll: Duration::from_millis(self.dispatch_poll_ms),
            tick: Duration::from_millis(self.tick_ms),
        }
    }
}

/// Settings for a [`Coordinator`](crate::wait::Coordinator). The binary does
/// not start one; services embedding the library build it from
/// [`options`](Self::options) with their own tenant and record sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub tick_secs: u64,
    pub tenant_concurrency: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_secs: 2,
            tenant_concurrency: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            tick: Duration::from_secs(self.tick_secs),
            tenant_concurrency: self.tenant_concurrency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            timeout_secs: 300,
        }
    }
}

impl WaitConfig {
    pub fn options(&self) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Default poll bounds for vendor adaptors built on
/// [`Poller`](crate::poller::Poller). Read by library consumers; the binary
/// runs no pollers itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            timeout_secs: 300,
        }
    }
}

impl PollerConfig {
    pub fn options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
