use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::flow::model::{Flow, FlowStatus, Task};
use crate::flow::store::{
    FlowFilter, FlowStore, MAX_PAGE_LIMIT, TaskFilter, list_all_flows, list_all_tasks,
};

#[async_trait]
pub trait TenantSource: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<String>>;
}

/// Business records waiting on a Flow.
#[async_trait]
pub trait InFlightRecords: Send + Sync {
    type Record: Send + Sync + 'static;

    /// Records of `tenant` currently in the in-flight status.
    async fn list_in_flight(&self, tenant: &str) -> Result<Vec<Self::Record>>;

    fn flow_id(&self, record: &Self::Record) -> Option<String>;

    /// Called once the referenced flow is Success or Failed. Expected to
    /// persist the updated record.
    async fn reconcile(
        &self,
        tenant: &str,
        record: Self::Record,
        flow: &Flow,
        tasks: &[Task],
    ) -> Result<()>;
}

/// How a finished operation is reported to the business layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Complete,
    Partial,
    Error,
}

impl RecordOutcome {
    /// Complete when the flow succeeded and produced everything requested;
    /// Error when nothing was produced; Partial otherwise.
    pub fn classify(flow_state: FlowStatus, requested: usize, produced: usize) -> Self {
        if produced == 0 {
            RecordOutcome::Error
        } else if flow_state == FlowStatus::Success && produced >= requested {
            RecordOutcome::Complete
        } else {
            RecordOutcome::Partial
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub tick: Duration,
    pub tenant_concurrency: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(2),
            tenant_concurrency: 10,
        }
    }
}

/// Reconciles in-flight business records of every tenant against the
/// flows they wait on.
pub struct Coordinator<R> {
    tenants: Arc<dyn TenantSource>,
    records: Arc<R>,
    store: Arc<dyn FlowStore>,
    options: CoordinatorOptions,
}

impl<R> Coordinator<R>
where
    R: InFlightRecords + 'static,
{
    pub fn new(
        tenants: Arc<dyn TenantSource>,
        records: Arc<R>,
        store: Arc<dyn FlowStore>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            tenants,
            records,
            store,
            options,
        }
    }

    /// Ticks until cancelled. A failed tick is logged; the next one runs anyway.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.options.tick.max(Duration::from_millis(1)));
        info!(tick = ?self.options.tick, "Wait coordinator started.");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(&cancel).await {
                Ok(0) => {}
                Ok(n) => info!(reconciled = n, "Reconciled in-flight records"),
                Err(e) => error!(error = ?e, "Wait coordinator tick failed"),
            }
        }
        info!("Wait coordinator stopping.");
        Ok(())
    }

    /// One pass over all tenants, at most `tenant_concurrency` at a time.
    ///
    /// The first tenant error cancels the rest of the pass and is returned
    /// once every spawned tenant task has finished.
    pub async fn tick(self: &Arc<Self>, cancel: &CancellationToken) -> Result<usize> {
        let tenants = self.tenants.list_tenants().await?;
        let group = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.options.tenant_concurrency.max(1)));
        let mut set = JoinSet::new();

        for tenant in tenants {
            let this = self.clone();
            let group = group.clone();
            let permits = permits.clone();
            set.spawn(async move { this.run_tenant(tenant, permits, group).await });
        }

        let mut first_error = None;
        let mut reconciled = 0;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("tenant task panicked: {e}")),
            };
            match outcome {
                Ok(n) => reconciled += n,
                Err(e) if first_error.is_none() => {
                    group.cancel();
                    first_error = Some(e);
                }
                Err(e) => warn!(error = ?e, "Additional tenant failure"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reconciled),
        }
    }

    async fn run_tenant(
        &self,
        tenant: String,
        permits: Arc<Semaphore>,
        group: CancellationToken,
    ) -> Result<usize> {
        let _permit = tokio::select! {
            _ = group.cancelled() => return Ok(0),
            permit = permits.acquire_owned() => permit?,
        };
        self.reconcile_tenant(&tenant, &group)
            .await
            .with_context(|| format!("reconcile tenant {}", tenant))
    }

    async fn reconcile_tenant(&self, tenant: &str, cancel: &CancellationToken) -> Result<usize> {
        let records = self.records.list_in_flight(tenant).await?;
        let mut by_flow: HashMap<String, Vec<R::Record>> = HashMap::new();
        for record in records {
            match self.records.flow_id(&record) {
                Some(flow_id) => by_flow.entry(flow_id).or_default().push(record),
                None => warn!(tenant = %tenant, "In-flight record carries no flow id"),
            }
        }
        if by_flow.is_empty() {
            return Ok(0);
        }

        let flow_ids: Vec<String> = by_flow.keys().cloned().collect();
        let mut reconciled = 0;
        for chunk in flow_ids.chunks(MAX_PAGE_LIMIT) {
            let filter = FlowFilter {
                ids: Some(chunk.to_vec()),
                states: Some(vec![FlowStatus::Success, FlowStatus::Failed]),
            };
            let flows = list_all_flows(self.store.as_ref(), &filter).await?;
            for flow in flows {
                if cancel.is_cancelled() {
                    debug!(tenant = %tenant, "Tenant pass cancelled");
                    return Ok(reconciled);
                }
                let tasks = list_all_tasks(self.store.as_ref(), &TaskFilter::by_flow(&flow.id)).await?;
                for record in by_flow.remove(&flow.id).unwrap_or_default() {
                    self.records.reconcile(tenant, record, &flow, &tasks).await?;
                    reconciled += 1;
                }
            }
        }
        Ok(reconciled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_outcomes() {
        assert_eq!(RecordOutcome::classify(FlowStatus::Success, 3, 3), RecordOutcome::Complete);
        assert_eq!(RecordOutcome::classify(FlowStatus::Success, 3, 2), RecordOutcome::Partial);
        assert_eq!(RecordOutcome::classify(FlowStatus::Failed, 3, 1), RecordOutcome::Partial);
        assert_eq!(RecordOutcome::classify(FlowStatus::Failed, 3, 0), RecordOutcome::Error);
        assert_eq!(RecordOutcome::classify(FlowStatus::Success, 3, 0), RecordOutcome::Error);
    }
}
