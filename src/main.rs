//! Queue relay service.
//!
//! Consumes JSON messages from a durable AMQP queue and forwards each one to
//! a downstream HTTP endpoint, acknowledging only what the endpoint accepted.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_broker::Supervisor;
use relay_delivery::{DeliveryClient, DeliveryOrchestrator, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!(
        amqp_url = %config.amqp_url_masked(),
        queue = %config.queue_name,
        downstream_url = %config.downstream_url,
        worker_pool_size = config.worker_pool_size,
        retry_max_attempts = config.retry_max_attempts,
        max_redeliveries = config.max_redeliveries,
        "Configuration loaded"
    );

    let client =
        DeliveryClient::new(config.to_client_config()).context("Failed to build HTTP client")?;
    let orchestrator = DeliveryOrchestrator::new(
        Arc::new(client),
        config.to_backoff_policy(),
        Arc::new(RealClock::new()),
    );
    let supervisor =
        Supervisor::new(config.to_supervisor_config(), orchestrator, Arc::new(RealClock::new()));

    let cancel = CancellationToken::new();
    let signal_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining in-flight deliveries");
            cancel.cancel();
        }
    });

    let result = supervisor.run(cancel).await;
    signal_task.abort();

    match result {
        Ok(()) => {
            info!("queue-relay shutdown complete");
            Ok(())
        },
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "queue-relay stopped");
            Err(e).context("Relay terminated")
        },
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
