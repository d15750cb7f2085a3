//! Repeat-until-settled polling of cloud resources whose mutations are not
//! immediately visible to reads.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PollError;

pub mod result;

pub use result::{BatchResult, ItemState};

/// Provider-specific half of a poll loop, implemented once per provider
/// and resource type.
#[async_trait]
pub trait PollingHandler: Send + Sync {
    type Client: Send + Sync;
    type Observed: Send;
    type Output: Send;

    /// Largest id batch the provider accepts in one query.
    fn batch_size(&self) -> usize {
        100
    }

    /// One provider query for a batch of at most `batch_size` ids.
    ///
    /// Returning fewer items than requested is not an error; the missing
    /// ids are simply not visible yet.
    async fn poll(&self, client: &Self::Client, ids: &[String]) -> Result<Vec<Self::Observed>>;

    /// Whether polling may stop, and the value to report.
    fn done(&self, requested: &[String], observed: &[Self::Observed]) -> (bool, Self::Output);
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct Poller<H> {
    handler: H,
    cancel: Option<CancellationToken>,
}

struct Expired<O> {
    error: PollError,
    last: Option<O>,
}

impl<H: PollingHandler> Poller<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// One round over all ids, chunked to the provider's batch size.
    pub async fn poll(&self, client: &H::Client, ids: &[String]) -> Result<Vec<H::Observed>> {
        let mut observed = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.handler.batch_size().max(1)) {
            observed.extend(self.handler.poll(client, chunk).await?);
        }
        Ok(observed)
    }

    /// Polls every `interval` until `done` holds.
    ///
    /// A failed round is logged and retried; only the deadline or the
    /// cancellation token ends the loop early. Returns within
    /// `timeout + interval`.
    pub async fn poll_until_done(
        &self,
        client: &H::Client,
        ids: &[String],
        options: &PollOptions,
    ) -> Result<H::Output, PollError> {
        self.run(client, ids, options).await.map_err(|e| e.error)
    }

    async fn run(
        &self,
        client: &H::Client,
        ids: &[String],
        options: &PollOptions,
    ) -> Result<H::Output, Expired<H::Output>> {
        if ids.is_empty() {
            return Err(Expired {
                error: PollError::EmptyIds,
                last: None,
            });
        }
        let resource = describe(ids);
        let deadline = Instant::now() + options.timeout;
        let mut last = None;
        let mut round = 0u32;

        loop {
            round += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::select! {
                _ = cancelled(&self.cancel) => {
                    return Err(Expired { error: PollError::Cancelled { resource }, last });
                }
                outcome = timeout(remaining, self.poll(client, ids)) => outcome,
            };

            match outcome {
                Ok(Ok(observed)) => {
                    let (finished, output) = self.handler.done(ids, &observed);
                    debug!(resource = %resource, round, observed = observed.len(), finished, "poll round");
                    if finished {
                        return Ok(output);
                    }
                    last = Some(output);
                }
                Ok(Err(e)) => {
                    warn!(resource = %resource, round, error = ?e, "Poll round failed, will retry");
                }
                Err(_) => {
                    warn!(resource = %resource, round, "Poll round hit the deadline");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = cancelled(&self.cancel) => {
                    return Err(Expired { error: PollError::Cancelled { resource }, last });
                }
                _ = tokio::time::sleep(options.interval) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        warn!(resource = %resource, timeout = ?options.timeout, "Polling timed out");
        Err(Expired {
            error: PollError::Timeout {
                resource,
                timeout: options.timeout,
            },
            last,
        })
    }
}

impl<H> Poller<H>
where
    H: PollingHandler<Output = BatchResult>,
{
    /// Like [`poll_until_done`](Self::poll_until_done), but a deadline is not
    /// an error: ids still unresolved are reported under `unknown`.
    pub async fn poll_until_settled(
        &self,
        client: &H::Client,
        ids: &[String],
        options: &PollOptions,
    ) -> Result<BatchResult, PollError> {
        let mut result = match self.run(client, ids, options).await {
            Ok(result) => result,
            Err(Expired {
                error: PollError::Timeout { .. },
                last,
            }) => last.unwrap_or_default(),
            Err(e) => return Err(e.error),
        };
        result.reconcile(ids);
        Ok(result)
    }
}

async fn cancelled(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn describe(ids: &[String]) -> String {
    const SHOWN: usize = 5;
    match ids {
        [one] => one.clone(),
        _ if ids.len() <= SHOWN => format!("[{}]", ids.join(", ")),
        _ => format!("[{}, ... +{} more]", ids[..SHOWN].join(", "), ids.len() - SHOWN),
    }
}
