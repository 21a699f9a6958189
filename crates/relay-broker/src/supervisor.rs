//! Connection lifecycle: connect with bounded retries, run consume sessions,
//! reconnect when the broker drops, stop cleanly on shutdown.

use std::sync::Arc;

use relay_delivery::{BackoffDecision, BackoffPolicy, Clock, DeliveryOrchestrator};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    connection::{BrokerConfig, ConnectionManager},
    dispatcher::{DispatchConfig, DispatchStats, Dispatcher, SessionEnd},
    error::Result,
    ledger::{RedeliveryLedger, DEFAULT_LEDGER_CAPACITY},
};

/// Default number of connection attempts before giving up.
pub const DEFAULT_CONNECT_MAX_ATTEMPTS: u32 = 5;

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Broker connection and topology.
    pub broker: BrokerConfig,
    /// Dispatch and worker pool.
    pub dispatch: DispatchConfig,
    /// Connection attempts per (re)connect before the error is fatal.
    pub connect_max_attempts: u32,
    /// Keys held by the redelivery ledger.
    pub ledger_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            dispatch: DispatchConfig::default(),
            connect_max_attempts: DEFAULT_CONNECT_MAX_ATTEMPTS,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// Owns the relay's connection to the broker.
pub struct Supervisor {
    config: SupervisorConfig,
    orchestrator: DeliveryOrchestrator,
    clock: Arc<dyn Clock>,
    ledger: Arc<RedeliveryLedger>,
    stats: Arc<RwLock<DispatchStats>>,
}

impl Supervisor {
    /// Creates a supervisor. Nothing connects until `run`.
    pub fn new(
        config: SupervisorConfig,
        orchestrator: DeliveryOrchestrator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = Arc::new(RedeliveryLedger::new(config.ledger_capacity));
        Self {
            config,
            orchestrator,
            clock,
            ledger,
            stats: Arc::new(RwLock::new(DispatchStats::default())),
        }
    }

    /// Counters shared by every session.
    pub fn stats(&self) -> Arc<RwLock<DispatchStats>> {
        self.stats.clone()
    }

    /// Runs until `cancel` fires or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once reconnect attempts are used up,
    /// a topology error, or a drain timeout during shutdown.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut session = 0u64;

        loop {
            let manager = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("shutdown requested before connecting");
                    return Ok(());
                },
                connected = self.connect_with_retry() => connected?,
            };

            session += 1;
            info!(session, "consume session starting");

            let outcome = self.run_session(&manager, &cancel).await;
            manager.close().await;

            match outcome {
                Ok(SessionEnd::Shutdown) => {
                    let stats = self.stats.read().await.clone();
                    info!(
                        received = stats.received,
                        acked = stats.acked,
                        requeued = stats.requeued,
                        rejected = stats.rejected,
                        dead_lettered = stats.dead_lettered,
                        "relay stopped"
                    );
                    return Ok(());
                },
                Ok(SessionEnd::ConnectionLost { reason }) => {
                    warn!(session, reason = %reason, "broker connection lost, reconnecting");
                },
                Err(error) if error.is_fatal() || cancel.is_cancelled() => {
                    error!(session, error = %error, "consume session failed");
                    return Err(error);
                },
                Err(error) => {
                    warn!(session, error = %error, "consume session failed, reconnecting");
                },
            }
        }
    }

    /// Connects, retrying with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns the last connection error after `connect_max_attempts`.
    pub async fn connect_with_retry(&self) -> Result<ConnectionManager> {
        let policy = BackoffPolicy::reconnect(self.config.connect_max_attempts);
        let mut attempt = 1;

        loop {
            match ConnectionManager::connect(self.config.broker.clone()).await {
                Ok(manager) => return Ok(manager),
                Err(error) => match policy.next(attempt) {
                    BackoffDecision::Retry { delay } => {
                        warn!(
                            attempt,
                            max_attempts = policy.max_attempts,
                            retry_in_ms = delay.as_millis(),
                            error = %error,
                            "broker connection failed, retrying"
                        );
                        self.clock.sleep(delay).await;
                        attempt += 1;
                    },
                    BackoffDecision::Stop { reason } => {
                        error!(
                            attempt,
                            reason = %reason,
                            error = %error,
                            "giving up on broker connection"
                        );
                        return Err(error);
                    },
                },
            }
        }
    }

    async fn run_session(
        &self,
        manager: &ConnectionManager,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        manager.declare_topology().await?;
        manager.set_prefetch(self.config.broker.prefetch).await?;
        let deliveries = manager.subscribe().await?;

        let dispatcher = Arc::new(Dispatcher::new(
            self.config.dispatch.clone(),
            self.orchestrator.clone(),
            Arc::new(manager.acknowledger()),
            self.ledger.clone(),
            self.stats.clone(),
        ));

        let session = dispatcher.run(deliveries, cancel.clone());
        tokio::pin!(session);

        tokio::select! {
            biased;
            end = &mut session => end,
            () = cancel.cancelled() => {
                // Stop new deliveries while in-flight ones drain; anything
                // still prefetched returns to the queue when the channel closes.
                if let Err(error) = manager.cancel_consumer().await {
                    warn!(error = %error, "consumer cancel failed");
                }
                session.await
            },
        }
    }
}
