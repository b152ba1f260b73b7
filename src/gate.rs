//! Decides whether an event is safe to act on: enough source confirmations,
//! and a header at or past the event's block synced all the way to the
//! destination.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::BlockSource;
use crate::error::{ChainError, GateError, ProofError};
use crate::proof::{ProofBuilder, ProofLink};

/// Whether `current` is at least `confirmations` blocks past `event_block`.
pub fn is_confirmed(current: u64, event_block: u64, confirmations: u64) -> bool {
    current.saturating_sub(event_block) >= confirmations
}

/// Polls source confirmations and header sync until both hold, bounded by a
/// single timeout.
#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    confirmations: u64,
    interval: Duration,
    timeout: Duration,
}

impl ConfirmationGate {
    /// `interval` is the pause between polls; `timeout` bounds a whole wait.
    pub fn new(confirmations: u64, interval: Duration, timeout: Duration) -> Self {
        Self {
            confirmations,
            interval,
            timeout,
        }
    }

    /// Waits for enough confirmations of `event_block`, then for a header at
    /// or past it to be synced all the way to the destination. Both stages
    /// share one deadline.
    pub async fn wait_until_ready(
        &self,
        source: &dyn BlockSource,
        links: &[ProofLink],
        event_block: u64,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        let deadline = Instant::now() + self.timeout;
        self.confirmations_by(source, event_block, deadline, cancel)
            .await?;
        debug!(block = event_block, "source block confirmed");
        self.header_sync_by(links, event_block, deadline, cancel)
            .await
    }

    /// Waits until the source chain is `confirmations` blocks past
    /// `event_block`.
    pub async fn wait_for_confirmations(
        &self,
        source: &dyn BlockSource,
        event_block: u64,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        self.confirmations_by(source, event_block, Instant::now() + self.timeout, cancel)
            .await
    }

    /// Waits until the destination has synced a header whose path back to the
    /// source chain covers `event_block`.
    pub async fn wait_for_header_sync(
        &self,
        links: &[ProofLink],
        event_block: u64,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        self.header_sync_by(links, event_block, Instant::now() + self.timeout, cancel)
            .await
    }

    async fn confirmations_by(
        &self,
        source: &dyn BlockSource,
        event_block: u64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        self.poll("confirmations", deadline, cancel, || async move {
            let current = source.block_number().await?;
            debug!(current, event_block, confirmations = self.confirmations, "checking confirmations");
            Ok::<_, ChainError>(is_confirmed(current, event_block, self.confirmations))
        })
        .await
    }

    async fn header_sync_by(
        &self,
        links: &[ProofLink],
        event_block: u64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), GateError> {
        self.poll("header sync", deadline, cancel, || path_synced(links, event_block))
            .await
    }

    async fn poll<F, Fut>(
        &self,
        operation: &'static str,
        deadline: Instant,
        cancel: &CancellationToken,
        mut check: F,
    ) -> Result<(), GateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ChainError>>,
    {
        let wait = async {
            loop {
                if check().await? {
                    return Ok::<(), GateError>(());
                }
                sleep(self.interval).await;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            res = timeout_at(deadline, wait) => res.unwrap_or(Err(GateError::Timeout {
                operation,
                seconds: self.timeout.as_secs(),
            })),
        }
    }
}

/// Whether the path the proof would take is anchored at or past
/// `event_block` on the source chain.
async fn path_synced(links: &[ProofLink], event_block: u64) -> Result<bool, ChainError> {
    let path = match ProofBuilder::synced_path(links).await {
        Ok(path) => path,
        Err(ProofError::Fetch { source, .. }) => return Err(source),
        Err(err) => {
            debug!(%err, "header not synced yet");
            return Ok(false);
        }
    };
    let (Some(link), Some(&anchor)) = (links.first(), path.first()) else {
        return Ok(true);
    };
    let Some(block) = link.chain.block_by_hash(anchor).await? else {
        return Ok(false);
    };
    let synced = block.number.unwrap_or_default().as_u64();
    debug!(synced, required = event_block, hops = links.len() - 1, "checking header sync");
    Ok(synced >= event_block)
}
