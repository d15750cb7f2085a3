use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::WaitError;
use crate::flow::model::FlowStatus;
use crate::flow::store::FlowStore;

pub mod coordinator;

pub use coordinator::{Coordinator, CoordinatorOptions, InFlightRecords, RecordOutcome, TenantSource};

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Blocks until the flow is Success (`Ok`), Failed (its recorded reason),
/// or the deadline passes (a timeout naming the flow).
pub async fn wait_for_flow(
    store: &dyn FlowStore,
    flow_id: &str,
    options: &WaitOptions,
) -> Result<(), WaitError> {
    wait_for_flow_with_cancel(store, flow_id, options, &CancellationToken::new()).await
}

pub async fn wait_for_flow_with_cancel(
    store: &dyn FlowStore,
    flow_id: &str,
    options: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + options.timeout;
    loop {
        let flow = store
            .get_flow(flow_id)
            .await
            .map_err(WaitError::Store)?
            .ok_or_else(|| WaitError::NotFound {
                flow_id: flow_id.to_string(),
            })?;

        match flow.state {
            FlowStatus::Success => return Ok(()),
            FlowStatus::Failed => {
                return Err(WaitError::FlowFailed {
                    flow_id: flow.id,
                    reason: flow.reason.unwrap_or_else(|| "no reason recorded".to_string()),
                });
            }
            state => debug!(flow_id = %flow_id, state = ?state, "flow not finished"),
        }

        if Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                flow_id: flow_id.to_string(),
                timeout: options.timeout,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled { flow_id: flow_id.to_string() });
            }
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}
