//! Turns delivered messages into downstream calls and ack/nack decisions.
//!
//! The dispatcher reads the consumer stream, hands messages to a bounded
//! worker pool and settles each one exactly once:
//!
//! - decoded and delivered: ack
//! - decoded but exhausted: nack with requeue, or moved to the dead-letter
//!   queue once the redelivery ceiling is passed
//! - not decodable: nack without requeue, downstream never called

use std::{sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use relay_delivery::{DeliveryOrchestrator, DeliveryOutcome};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    ack::{Acknowledger, Disposition},
    error::Result,
    ledger::RedeliveryLedger,
    message::QueueMessage,
    worker_pool::WorkerPool,
};

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of requeues before a message is dead-lettered.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Messages processed concurrently.
    pub worker_count: usize,
    /// Requeues allowed before dead-lettering, `0` to requeue forever.
    pub max_redeliveries: u32,
    /// Time allowed for in-flight messages to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for one relay process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Workers currently running.
    pub active_workers: usize,
    /// Messages read from the consumer.
    pub received: u64,
    /// Messages being handled right now.
    pub in_flight: usize,
    /// Messages acknowledged.
    pub acked: u64,
    /// Messages nacked with requeue.
    pub requeued: u64,
    /// Undecodable messages nacked without requeue.
    pub rejected: u64,
    /// Messages moved to the dead-letter queue past the redelivery ceiling.
    pub dead_lettered: u64,
    /// Acks or nacks the broker did not accept.
    pub settle_failures: u64,
}

impl DispatchStats {
    /// Messages that reached a final disposition.
    pub fn settled(&self) -> u64 {
        self.acked + self.requeued + self.rejected + self.dead_lettered
    }

    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Requeue => self.requeued += 1,
            Disposition::Reject => self.rejected += 1,
            Disposition::DeadLetter => self.dead_lettered += 1,
        }
    }
}

/// Why a consume session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested and in-flight work drained.
    Shutdown,
    /// The consumer stream failed or ended.
    ConnectionLost {
        /// What ended the stream
        reason: String,
    },
}

/// Handles messages for one consume session.
pub struct Dispatcher {
    config: DispatchConfig,
    orchestrator: DeliveryOrchestrator,
    acknowledger: Arc<dyn Acknowledger>,
    ledger: Arc<RedeliveryLedger>,
    stats: Arc<RwLock<DispatchStats>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// The ledger and stats are shared so they outlive a reconnect.
    pub fn new(
        config: DispatchConfig,
        orchestrator: DeliveryOrchestrator,
        acknowledger: Arc<dyn Acknowledger>,
        ledger: Arc<RedeliveryLedger>,
        stats: Arc<RwLock<DispatchStats>>,
    ) -> Self {
        Self { config, orchestrator, acknowledger, ledger, stats }
    }

    /// Dispatch settings.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<RwLock<DispatchStats>> {
        self.stats.clone()
    }

    /// Processes one message and settles it.
    ///
    /// Never fails: a settlement the broker rejects is logged and counted,
    /// and the broker redelivers the message once the channel is gone.
    pub async fn handle(&self, message: QueueMessage) -> Disposition {
        let span = info_span!(
            "relay_message",
            delivery_tag = message.handle.delivery_tag(),
            redelivered = message.redelivered,
        );

        async {
            self.stats.write().await.in_flight += 1;

            let disposition = self.decide(&message).await;

            let settled = self.acknowledger.settle(&message, disposition).await;
            if let Err(error) = &settled {
                error!(error = %error, %disposition, "failed to settle message");
            }

            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.record(disposition);
            if settled.is_err() {
                stats.settle_failures += 1;
            }

            disposition
        }
        .instrument(span)
        .await
    }

    async fn decide(&self, message: &QueueMessage) -> Disposition {
        let payload = match message.decode() {
            Ok(payload) => payload,
            Err(error) => {
                error!(
                    error = %error,
                    bytes = message.payload.len(),
                    "discarding undecodable message"
                );
                return Disposition::Reject;
            },
        };

        match self.orchestrator.deliver(&payload).await {
            DeliveryOutcome::Succeeded { attempts, response } => {
                info!(attempts, status_code = response.status_code, "message delivered");
                self.ledger.clear(&message.ledger_key());
                Disposition::Ack
            },
            DeliveryOutcome::Exhausted { attempts, last_error } => {
                self.after_exhaustion(message, attempts, &last_error.to_string())
            },
        }
    }

    fn after_exhaustion(
        &self,
        message: &QueueMessage,
        attempts: u32,
        last_error: &str,
    ) -> Disposition {
        if self.config.max_redeliveries == 0 {
            error!(attempts, last_error, "delivery exhausted, requeueing");
            return Disposition::Requeue;
        }

        let key = message.ledger_key();
        let cycles =
            self.ledger.record_exhaustion(&key, message.redelivered, message.delivery_count);

        if cycles > self.config.max_redeliveries {
            error!(
                attempts,
                cycles,
                max_redeliveries = self.config.max_redeliveries,
                last_error,
                "redelivery ceiling reached, dead-lettering"
            );
            self.ledger.clear(&key);
            Disposition::DeadLetter
        } else {
            error!(attempts, cycles, last_error, "delivery exhausted, requeueing");
            Disposition::Requeue
        }
    }

    /// Consumes `deliveries` until shutdown or until the stream fails.
    ///
    /// At most `worker_count` messages are handled at once. On return every
    /// message read from the stream has been settled, unless the drain hit
    /// the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ShutdownTimeout` if workers do not drain in time.
    pub async fn run<S>(
        self: Arc<Self>,
        mut deliveries: S,
        cancel: CancellationToken,
    ) -> Result<SessionEnd>
    where
        S: Stream<Item = Result<QueueMessage>> + Send + Unpin,
    {
        let worker_count = self.config.worker_count.max(1);
        let (sender, receiver) = mpsc::channel(worker_count);

        let mut pool = WorkerPool::new(self.clone(), receiver, worker_count);
        pool.spawn_workers().await;

        let end = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break SessionEnd::Shutdown,
                next = deliveries.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(error)) => break SessionEnd::ConnectionLost { reason: error.to_string() },
                None => {
                    let reason = "consumer stream ended".to_string();
                    break SessionEnd::ConnectionLost { reason };
                },
            };

            self.stats.write().await.received += 1;
            let delivery_tag = message.handle.delivery_tag();

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(
                        delivery_tag,
                        "shutdown before dispatch, leaving message for redelivery"
                    );
                    break SessionEnd::Shutdown;
                },
                sent = sender.send(message) => {
                    if sent.is_err() {
                        let reason = "worker pool closed".to_string();
                        break SessionEnd::ConnectionLost { reason };
                    }
                },
            }
        };

        match &end {
            SessionEnd::Shutdown => info!("shutdown requested, draining in-flight messages"),
            SessionEnd::ConnectionLost { reason } => warn!(reason = %reason, "consumer stopped"),
        }

        drop(sender);
        pool.shutdown_graceful(self.config.shutdown_timeout).await?;

        Ok(end)
    }
}
