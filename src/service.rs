use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{H256, TransactionReceipt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, field, info, instrument, warn};
use uuid::Uuid;

use crate::chain::{BlockSource, TransactionSender};
use crate::config::{ProcessorConfig, Vaults};
use crate::error::{ChainError, Disposition, RelayerError, StoreError};
use crate::gate::ConfirmationGate;
use crate::lock::EventLocks;
use crate::profit::{self, Estimate, gas_with_margin};
use crate::proof::ProofBuilder;
use crate::queue::{Delivery, MessageQueue};
use crate::store::EventStore;
use crate::types::{EventId, EventRecord, MessageEvent, MessageStatus, OnChainStatus};

/// Tunables of the processing loop.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Chain id of the destination; messages addressed elsewhere are malformed.
    pub dest_chain_id: u64,
    /// Skip messages whose fee does not cover the estimated cost.
    pub profitable_only: bool,
    /// Delay before a failed attempt is redelivered.
    pub backoff_retry_interval: Duration,
    /// Retriable failures allowed before an event is failed.
    pub backoff_max_retries: u32,
    /// Deliveries handled concurrently.
    pub queue_prefetch: usize,
    /// How long to wait for a submitted transaction to be mined.
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// Token vaults, used to label events by kind.
    pub vaults: Vaults,
}

impl ProcessorSettings {
    /// Settings from a validated config and the chain id the destination
    /// node reported.
    pub fn from_config(config: &ProcessorConfig, dest_chain_id: u64) -> Self {
        Self {
            dest_chain_id,
            profitable_only: config.profitable_only,
            backoff_retry_interval: config.backoff_retry_interval,
            backoff_max_retries: config.backoff_max_retries,
            queue_prefetch: config.queue_prefetch,
            receipt_timeout: config.confirmation_timeout,
            receipt_poll_interval: config.header_sync_interval,
            vaults: config.vaults,
        }
    }
}

/// Why a delivery was acked without changing its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record already reached a final status.
    AlreadyFinal(MessageStatus),
    /// Zero gas limit: only the message owner may process it.
    OwnerOnly,
    /// The fee does not cover the estimated cost.
    Unprofitable(Estimate),
}

/// What handling one delivery came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
    /// Redelivery scheduled after this many failed attempts.
    Requeued { attempts: u32 },
    Skipped(SkipReason),
    /// Shutdown interrupted the attempt; the delivery went back untouched.
    Cancelled,
    /// The body was not a message event. Acked and dropped.
    Discarded,
}

enum Step {
    Done { tx_hash: Option<H256> },
    Fail(String),
    Skipped(SkipReason),
}

/// Consumes message events from the queue and drives each one to a final
/// status on the destination chain.
pub struct Processor {
    settings: ProcessorSettings,
    gate: ConfirmationGate,
    store: Arc<dyn EventStore>,
    queue: Arc<dyn MessageQueue>,
    /// Source chain client
    source: Arc<dyn BlockSource>,
    /// Signed destination bridge client
    sender: Arc<dyn TransactionSender>,
    prover: Arc<ProofBuilder>,
    locks: EventLocks,
    /// Failed attempts the store has not recorded yet, per event.
    unrecorded: Mutex<HashMap<EventId, u32>>,
}

impl Processor {
    /// Assembles a processor; [`crate::connect`] does this from a config.
    pub fn new(
        settings: ProcessorSettings,
        gate: ConfirmationGate,
        store: Arc<dyn EventStore>,
        queue: Arc<dyn MessageQueue>,
        source: Arc<dyn BlockSource>,
        sender: Arc<dyn TransactionSender>,
        prover: Arc<ProofBuilder>,
    ) -> Self {
        Self {
            settings,
            gate,
            store,
            queue,
            source,
            sender,
            prover,
            locks: EventLocks::new(),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// Pulls deliveries until the queue closes or `cancel` fires, handling up
    /// to `queue_prefetch` of them at once. In-flight deliveries are drained
    /// before returning.
    #[instrument(skip_all, fields(prefetch = self.settings.queue_prefetch))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), RelayerError> {
        info!("Starting processor");
        let permits = Arc::new(Semaphore::new(self.settings.queue_prefetch.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => {
                    permit.map_err(|e| RelayerError::Other(e.into()))?
                }
            };
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = self.queue.receive() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let processor = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                processor.handle(delivery, &cancel).await
            });
            while let Some(joined) = tasks.try_join_next() {
                Self::reap(joined);
            }
        }

        info!(in_flight = tasks.len(), "Stopping processor");
        while let Some(joined) = tasks.join_next().await {
            Self::reap(joined);
        }
        Ok(())
    }

    fn reap(joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(outcome) => debug!(?outcome, "delivery handled"),
            Err(e) => error!("Processing task failed: {}", e),
        }
    }

    /// Handles one delivery end to end. Always settles it: acked, or
    /// requeued for a later attempt.
    #[instrument(
        name = "process",
        skip_all,
        fields(
            tag = delivery.tag,
            attempt_id = %Uuid::new_v4(),
            event = field::Empty,
            kind = field::Empty,
        )
    )]
    pub async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) -> Outcome {
        let started = Instant::now();
        let event: MessageEvent = match serde_json::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                error!(%err, "undecodable queue message, discarding");
                self.ack(&delivery).await;
                return Outcome::Discarded;
            }
        };
        let span = Span::current();
        span.record("event", field::display(event.id));
        span.record("kind", field::display(self.settings.vaults.kind_of(event.message.to)));
        debug!(block = event.block_number, redelivered = delivery.redelivered, "received message");

        // cheap check so a redelivered final event does not wait on the gates
        match self.store.get(&event.id).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                self.ack(&delivery).await;
                return Outcome::Skipped(SkipReason::AlreadyFinal(record.status));
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not read event record"),
        }

        let ready = match self.validate(&event) {
            Err(err) => Err(err),
            Ok(Some(skip)) => Ok(Some(Step::Skipped(skip))),
            Ok(None) => self.await_finality(&event, cancel).await.map(|()| None),
        };

        let _guard = self.locks.lock(event.id).await;
        let mut record = match self.load(&event).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "could not load event record");
                let attempts = self.unrecorded_attempts(&event.id).await.saturating_add(1);
                return self.retry_unrecorded(&delivery, event.id, attempts).await;
            }
        };
        record.attempts = record
            .attempts
            .max(self.unrecorded_attempts(&event.id).await);
        if record.status.is_terminal() {
            self.ack(&delivery).await;
            return Outcome::Skipped(SkipReason::AlreadyFinal(record.status));
        }

        let result = match ready {
            Ok(None) => self.execute(&record.event, cancel).await,
            Ok(Some(step)) => Ok(step),
            Err(err) => Err(err),
        };
        let outcome = self.settle(&delivery, record, result).await;
        debug!(?outcome, elapsed_ms = started.elapsed().as_millis() as u64, "attempt finished");
        outcome
    }

    /// Rejects events that can never be processed. `Ok(Some(_))` means the
    /// event is well formed but not ours to process.
    fn validate(&self, event: &MessageEvent) -> Result<Option<SkipReason>, RelayerError> {
        if event.msg_hash.is_zero() {
            return Err(RelayerError::ValidationError("message hash is zero".into()));
        }
        if event.message.dest_chain_id != self.settings.dest_chain_id {
            return Err(RelayerError::ValidationError(format!(
                "destination chain {} is not {}",
                event.message.dest_chain_id, self.settings.dest_chain_id
            )));
        }
        if event.message.to.is_zero() {
            return Err(RelayerError::ValidationError("recipient is the zero address".into()));
        }
        if event.block_number == 0 {
            return Err(RelayerError::ValidationError("source block number missing".into()));
        }
        if event.message.gas_limit.is_zero() {
            return Ok(Some(SkipReason::OwnerOnly));
        }
        Ok(None)
    }

    async fn await_finality(
        &self,
        event: &MessageEvent,
        cancel: &CancellationToken,
    ) -> Result<(), RelayerError> {
        self.gate
            .wait_until_ready(
                self.source.as_ref(),
                self.prover.links(),
                event.block_number,
                cancel,
            )
            .await?;
        debug!(block = event.block_number, "header synced to destination");
        Ok(())
    }

    async fn load(&self, event: &MessageEvent) -> Result<EventRecord, StoreError> {
        if let Some(record) = self.store.get(&event.id).await? {
            return Ok(record);
        }
        let record = EventRecord::new(event.clone());
        self.store.save(record.clone()).await?;
        Ok(record)
    }

    async fn execute(
        &self,
        event: &MessageEvent,
        cancel: &CancellationToken,
    ) -> Result<Step, RelayerError> {
        match self.sender.message_status(event.msg_hash).await? {
            OnChainStatus::Done | OnChainStatus::Retriable => {
                info!("message already processed on destination");
                return Ok(Step::Done { tx_hash: None });
            }
            OnChainStatus::Failed => {
                return Ok(Step::Fail("message failed on destination".into()));
            }
            OnChainStatus::New => {}
        }

        let proof = self.prover.build(event).await?;
        let encoded = proof.encode();
        debug!(segments = proof.segment_count(), bytes = encoded.len(), "built signal proof");

        let gas = if self.settings.profitable_only {
            let estimate = profit::estimate(self.sender.as_ref(), &event.message, &encoded).await?;
            if !estimate.is_profitable() {
                return Ok(Step::Skipped(SkipReason::Unprofitable(estimate)));
            }
            estimate.gas
        } else {
            self.sender
                .estimate_process_message(&event.message, &encoded)
                .await?
        };

        let gas = gas_with_margin(gas);
        let tx_hash = self
            .sender
            .process_message(&event.message, &encoded, gas)
            .await?;
        info!(tx_hash = ?tx_hash, %gas, "submitted processMessage");

        let receipt = self.wait_for_receipt(tx_hash, cancel).await?;
        if receipt.status.is_some_and(|s| s.as_u64() == 1) {
            return Ok(Step::Done {
                tx_hash: Some(tx_hash),
            });
        }
        let reason = self.sender.revert_reason(tx_hash).await?;
        warn!(tx_hash = ?tx_hash, %reason, "processMessage reverted");
        Err(ChainError::Reverted(reason).into())
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, RelayerError> {
        let poll = async {
            loop {
                if let Some(receipt) = self.sender.transaction_receipt(tx_hash).await? {
                    return Ok::<_, RelayerError>(receipt);
                }
                sleep(self.settings.receipt_poll_interval).await;
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayerError::Cancelled),
            res = timeout(self.settings.receipt_timeout, poll) => {
                res.unwrap_or_else(|_| Err(RelayerError::Timeout {
                    operation: format!("receipt of {tx_hash:#x}"),
                    seconds: self.settings.receipt_timeout.as_secs(),
                }))
            }
        }
    }

    /// Writes the attempt's result and acks or requeues the delivery.
    /// Runs inside the event's exclusive section.
    async fn settle(
        &self,
        delivery: &Delivery,
        mut record: EventRecord,
        result: Result<Step, RelayerError>,
    ) -> Outcome {
        match result {
            Ok(Step::Skipped(reason)) => {
                info!(?reason, "skipping message");
                self.ack(delivery).await;
                Outcome::Skipped(reason)
            }
            Ok(Step::Done { tx_hash }) => {
                info!(tx_hash = ?tx_hash, attempt = record.attempts + 1, "processed message");
                record.status = MessageStatus::Done;
                record.last_error = None;
                self.finish(delivery, record, Outcome::Done).await
            }
            Ok(Step::Fail(reason)) => {
                error!(%reason, "message failed");
                record.status = MessageStatus::Failed;
                record.last_error = Some(reason);
                self.finish(delivery, record, Outcome::Failed).await
            }
            Err(err) => {
                let disposition = err.disposition();
                if disposition == Disposition::Cancelled {
                    info!("attempt cancelled, requeueing");
                    self.requeue(delivery, Duration::ZERO).await;
                    return Outcome::Cancelled;
                }

                record.attempts = record.attempts.saturating_add(1);
                record.last_error = Some(err.to_string());
                let max_retries = self.settings.backoff_max_retries;
                if disposition == Disposition::Retry && record.attempts <= max_retries {
                    warn!(attempt = record.attempts, max_retries, error = %err, "attempt failed, retrying");
                    record.status = MessageStatus::Retriable;
                    let attempts = record.attempts;
                    if self.persist(&record).await {
                        self.forget_attempts(&record.id()).await;
                    } else {
                        self.remember_attempts(record.id(), attempts).await;
                    }
                    self.requeue(delivery, self.settings.backoff_retry_interval)
                        .await;
                    Outcome::Requeued { attempts }
                } else {
                    error!(attempt = record.attempts, max_retries, error = %err, "giving up on message");
                    record.status = MessageStatus::Failed;
                    self.finish(delivery, record, Outcome::Failed).await
                }
            }
        }
    }

    /// Persists a final record and acks. If the write fails the delivery is
    /// requeued so a later attempt can record the status, and the unrecorded
    /// write counts as one more failed attempt.
    async fn finish(&self, delivery: &Delivery, record: EventRecord, outcome: Outcome) -> Outcome {
        let id = record.id();
        if self.persist(&record).await {
            self.forget_attempts(&id).await;
            self.ack(delivery).await;
            return outcome;
        }
        let attempts = self
            .unrecorded_attempts(&id)
            .await
            .max(record.attempts)
            .saturating_add(1);
        self.retry_unrecorded(delivery, id, attempts).await
    }

    /// Requeues an attempt whose result the store could not take, unless the
    /// event already used up its retries. Then it is acked and dropped, as
    /// there is nowhere to record the failure.
    async fn retry_unrecorded(&self, delivery: &Delivery, id: EventId, attempts: u32) -> Outcome {
        let max_retries = self.settings.backoff_max_retries;
        if attempts > max_retries {
            error!(attempt = attempts, max_retries, "store unavailable, giving up on message");
            self.forget_attempts(&id).await;
            self.ack(delivery).await;
            return Outcome::Failed;
        }
        warn!(attempt = attempts, max_retries, "store unavailable, retrying");
        self.remember_attempts(id, attempts).await;
        self.requeue(delivery, self.settings.backoff_retry_interval)
            .await;
        Outcome::Requeued { attempts }
    }

    async fn unrecorded_attempts(&self, id: &EventId) -> u32 {
        self.unrecorded.lock().await.get(id).copied().unwrap_or_default()
    }

    async fn remember_attempts(&self, id: EventId, attempts: u32) {
        let mut unrecorded = self.unrecorded.lock().await;
        let entry = unrecorded.entry(id).or_default();
        *entry = (*entry).max(attempts);
    }

    async fn forget_attempts(&self, id: &EventId) {
        self.unrecorded.lock().await.remove(id);
    }

    async fn persist(&self, record: &EventRecord) -> bool {
        match self.store.save(record.clone()).await {
            Ok(()) => true,
            Err(err) => {
                error!(%err, status = %record.status, "failed to save event record");
                false
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(err) = self.queue.ack(delivery).await {
            error!(%err, tag = delivery.tag, "failed to ack delivery");
        }
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) {
        if let Err(err) = self.queue.requeue(delivery, delay).await {
            error!(%err, tag = delivery.tag, "failed to requeue delivery");
        }
    }
}
