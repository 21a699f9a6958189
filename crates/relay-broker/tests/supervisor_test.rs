//! Connection lifecycle tests that need no running broker.
//!
//! An unreachable address makes every connection attempt fail fast, so the
//! retry schedule and the fatal exit can be observed through a test clock.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use relay_broker::{BrokerConfig, BrokerError, Supervisor, SupervisorConfig};
use relay_delivery::{
    client::mock::ScriptedSender, BackoffPolicy, DeliveryOrchestrator, TestClock,
};
use tokio_util::sync::CancellationToken;

fn unreachable_supervisor(connect_max_attempts: u32, clock: &TestClock) -> Supervisor {
    let config = SupervisorConfig {
        broker: BrokerConfig {
            url: "amqp://127.0.0.1:1/%2f".to_string(),
            ..Default::default()
        },
        connect_max_attempts,
        ..Default::default()
    };
    let orchestrator = DeliveryOrchestrator::new(
        Arc::new(ScriptedSender::succeeding()),
        BackoffPolicy::default(),
        Arc::new(clock.clone()),
    );

    Supervisor::new(config, orchestrator, Arc::new(clock.clone()))
}

#[tokio::test]
async fn connect_retries_with_backoff_then_gives_up() {
    let clock = TestClock::new();
    let supervisor = unreachable_supervisor(3, &clock);

    let error = supervisor.connect_with_retry().await.unwrap_err();

    assert!(matches!(error, BrokerError::Connection { .. }));
    assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
}

#[tokio::test]
async fn unreachable_broker_is_fatal_for_run() {
    let clock = TestClock::new();
    let supervisor = unreachable_supervisor(2, &clock);

    let result = supervisor.run(CancellationToken::new()).await;

    let error = result.unwrap_err();
    assert!(error.is_fatal());
    assert_eq!(clock.recorded_sleeps().len(), 1);
}

#[tokio::test]
async fn cancelled_before_connect_returns_cleanly() {
    let clock = TestClock::new();
    let supervisor = unreachable_supervisor(5, &clock);
    let cancel = CancellationToken::new();
    cancel.cancel();

    supervisor.run(cancel).await.expect("shutdown before connect is not an error");

    assert!(clock.recorded_sleeps().is_empty());
    assert_eq!(supervisor.stats().read().await.received, 0);
}
