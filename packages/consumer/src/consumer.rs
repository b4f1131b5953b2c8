//! Consumer Loop
//!
//! Pulls one delivery at a time, runs it through transform and persist, and
//! acknowledges it once the pipeline has settled.
//!
//! Every per-message failure is logged and acked: undecodable payloads,
//! malformed numeric fields and store errors alike. Only a failed ack (or a
//! broken subscription) ends the loop; the broker then redelivers whatever
//! was left unacknowledged.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::queue::{InboundMessage, MessageSource, QueueError};
use crate::sink::{PersistError, Sink};
use crate::transform::{MessageTransformer, RawMessage};

/// Upper bound on a single persist call
pub const DEFAULT_PERSIST_TIMEOUT_MS: u64 = 5000;

/// Payload bytes included in failure logs
pub const PAYLOAD_PREVIEW_BYTES: usize = 512;

/// How a delivery settled; every outcome is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Normalized and written to the store
    Persisted,
    /// Payload was not a JSON object
    Undecodable,
    /// A numeric field failed to normalize
    Malformed,
    /// The store rejected the write or timed out
    PersistFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Persisted => "persisted",
            Outcome::Undecodable => "undecodable",
            Outcome::Malformed => "malformed",
            Outcome::PersistFailed => "persist_failed",
        }
    }
}

/// Per-loop message counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub persisted: u64,
    pub undecodable: u64,
    pub malformed: u64,
    pub persist_failed: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Persisted => self.persisted += 1,
            Outcome::Undecodable => self.undecodable += 1,
            Outcome::Malformed => self.malformed += 1,
            Outcome::PersistFailed => self.persist_failed += 1,
        }
    }

    /// Deliveries that reached the ack step
    pub fn acknowledged(&self) -> u64 {
        self.persisted + self.undecodable + self.malformed + self.persist_failed
    }

    pub fn merge(&mut self, other: &ConsumerStats) {
        self.received += other.received;
        self.persisted += other.persisted;
        self.undecodable += other.undecodable;
        self.malformed += other.malformed;
        self.persist_failed += other.persist_failed;
    }
}

/// Resolve once the shutdown flag is raised or its sender is dropped
pub async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Run a startup step unless shutdown is requested first
///
/// # Returns
/// The step's output, or `None` when shutdown won
pub async fn unless_shutdown<F: Future>(step: F, shutdown: &watch::Receiver<bool>) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown.clone()) => None,
        output = step => Some(output),
    }
}

/// Sequential consume → transform → persist → ack loop over one subscription
pub struct ConsumerLoop<Q, S> {
    source: Q,
    sink: S,
    transformer: MessageTransformer,
    persist_timeout: Duration,
    worker: usize,
    stats: ConsumerStats,
}

impl<Q: MessageSource, S: Sink> ConsumerLoop<Q, S> {
    pub fn new(source: Q, sink: S, transformer: MessageTransformer) -> Self {
        Self {
            source,
            sink,
            transformer,
            persist_timeout: Duration::from_millis(DEFAULT_PERSIST_TIMEOUT_MS),
            worker: 0,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_persist_timeout(mut self, persist_timeout: Duration) -> Self {
        self.persist_timeout = persist_timeout;
        self
    }

    /// Tag log lines with a worker index
    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Process deliveries until the subscription ends or `shutdown` resolves
    ///
    /// Shutdown is only observed between messages; a delivery that has been
    /// received is always carried through to its ack.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<ConsumerStats, QueueError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(worker = self.worker, "Shutdown requested, consumer stopping");
                    break;
                }
                next = self.source.recv() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.handle(message).await?;
                }
                Some(Err(e)) => {
                    error!(worker = self.worker, error = %e, "Subscription failed");
                    return Err(e);
                }
                None => {
                    warn!(worker = self.worker, "Subscription ended by broker");
                    break;
                }
            }
        }

        Ok(self.stats)
    }

    /// Run one delivery through the pipeline and acknowledge it
    ///
    /// # Returns
    /// How the delivery settled, or the ack failure
    pub async fn handle(&mut self, message: InboundMessage) -> Result<Outcome, QueueError> {
        self.stats.received += 1;
        debug!(
            worker = self.worker,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "Received"
        );

        let outcome = self.process(&message).await;

        self.source.ack(&message).await?;
        self.stats.record(outcome);
        debug!(
            worker = self.worker,
            delivery_tag = message.delivery_tag,
            outcome = outcome.as_str(),
            "Acknowledged"
        );

        Ok(outcome)
    }

    async fn process(&self, message: &InboundMessage) -> Outcome {
        let raw = match RawMessage::from_slice(&message.payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    worker = self.worker,
                    delivery_tag = message.delivery_tag,
                    redelivered = message.redelivered,
                    payload = %message.payload_preview(PAYLOAD_PREVIEW_BYTES),
                    error = %e,
                    "Dropping undecodable message"
                );
                return Outcome::Undecodable;
            }
        };

        debug!(worker = self.worker, delivery_tag = message.delivery_tag, "Transforming");
        let record = match self.transformer.transform(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    worker = self.worker,
                    delivery_tag = message.delivery_tag,
                    redelivered = message.redelivered,
                    field = e.field,
                    payload = %message.payload_preview(PAYLOAD_PREVIEW_BYTES),
                    error = %e,
                    "Dropping message with malformed numeric field"
                );
                return Outcome::Malformed;
            }
        };

        debug!(worker = self.worker, delivery_tag = message.delivery_tag, "Persisting");
        let result = match timeout(self.persist_timeout, self.sink.persist(&record)).await {
            Ok(result) => result,
            Err(_) => Err(PersistError::Timeout(self.persist_timeout.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                info!(
                    worker = self.worker,
                    delivery_tag = message.delivery_tag,
                    block_number = ?record.block_number(),
                    log_index = ?record.log_index(),
                    "Persisted event"
                );
                Outcome::Persisted
            }
            Err(e) => {
                error!(
                    worker = self.worker,
                    delivery_tag = message.delivery_tag,
                    redelivered = message.redelivered,
                    payload = %message.payload_preview(PAYLOAD_PREVIEW_BYTES),
                    error = %e,
                    "Failed to persist event, acknowledging anyway"
                );
                Outcome::PersistFailed
            }
        }
    }
}
