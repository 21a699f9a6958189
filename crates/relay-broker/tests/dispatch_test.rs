//! Dispatch tests: decode, deliver, settle.
//!
//! Runs the dispatcher against a scripted sender and a recording
//! acknowledger, so every ack and nack can be checked without a broker.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use futures::stream::{self, StreamExt};
use relay_broker::{
    ack::mock::{RecordingAcknowledger, Settlement},
    BrokerError, DeliveryHandle, DispatchConfig, DispatchStats, Dispatcher, Disposition,
    QueueMessage, RedeliveryLedger, SessionEnd,
};
use relay_delivery::{
    client::mock::ScriptedSender, BackoffPolicy, DeliveryError, DeliveryOrchestrator, TestClock,
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct Harness {
    dispatcher: Arc<Dispatcher>,
    sender: ScriptedSender,
    acker: RecordingAcknowledger,
    clock: TestClock,
}

impl Harness {
    fn new(sender: ScriptedSender, config: DispatchConfig) -> Self {
        let acker = RecordingAcknowledger::new();
        let clock = TestClock::new();
        let orchestrator = DeliveryOrchestrator::new(
            Arc::new(sender.clone()),
            BackoffPolicy::default(),
            Arc::new(clock.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config,
            orchestrator,
            Arc::new(acker.clone()),
            Arc::new(RedeliveryLedger::default()),
            Arc::new(RwLock::new(DispatchStats::default())),
        ));

        Self { dispatcher, sender, acker, clock }
    }

    async fn stats(&self) -> DispatchStats {
        self.dispatcher.stats().read().await.clone()
    }
}

fn account_message(tag: u64) -> QueueMessage {
    QueueMessage::new(tag, json!({"branch": 1, "number": 100}).to_string())
}

fn server_errors(count: usize) -> Vec<relay_delivery::Result<relay_delivery::DeliveryResponse>> {
    (0..count).map(|_| Err(DeliveryError::server_error(503, "unavailable"))).collect()
}

#[tokio::test]
async fn first_attempt_success_is_acked_once() {
    let harness = Harness::new(ScriptedSender::succeeding(), DispatchConfig::default());

    let disposition = harness.dispatcher.handle(account_message(1)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.sender.call_count(), 1);
    assert_eq!(harness.sender.calls()[0].0, json!({"branch": 1, "number": 100}));
    assert_eq!(harness.acker.settlements(), vec![Settlement::Ack(DeliveryHandle(1))]);
    assert!(harness.clock.recorded_sleeps().is_empty());
}

#[tokio::test]
async fn third_attempt_success_waits_twice_then_acks() {
    let harness =
        Harness::new(ScriptedSender::with_script(server_errors(2)), DispatchConfig::default());

    let disposition = harness.dispatcher.handle(account_message(1)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(harness.sender.call_count(), 3);
    assert_eq!(harness.clock.recorded_sleeps(), vec![
        Duration::from_millis(1000),
        Duration::from_millis(2000)
    ]);
    assert_eq!(harness.acker.settlements(), vec![Settlement::Ack(DeliveryHandle(1))]);
}

#[tokio::test]
async fn exhausted_delivery_is_nacked_with_requeue() {
    let harness = Harness::new(ScriptedSender::failing(), DispatchConfig::default());

    let disposition = harness.dispatcher.handle(account_message(1)).await;

    assert_eq!(disposition, Disposition::Requeue);
    assert_eq!(harness.sender.call_count(), 3);
    assert_eq!(harness.acker.settlements(), vec![Settlement::Nack {
        handle: DeliveryHandle(1),
        requeue: true
    }]);
}

#[tokio::test]
async fn malformed_payload_never_reaches_downstream() {
    let harness = Harness::new(ScriptedSender::succeeding(), DispatchConfig::default());

    let disposition = harness.dispatcher.handle(QueueMessage::new(7, "{not json")).await;

    assert_eq!(disposition, Disposition::Reject);
    assert_eq!(harness.sender.call_count(), 0);
    assert_eq!(harness.acker.settlements(), vec![Settlement::Nack {
        handle: DeliveryHandle(7),
        requeue: false
    }]);
    assert_eq!(harness.stats().await.rejected, 1);
}

#[tokio::test]
async fn burst_never_exceeds_worker_count() -> Result<()> {
    let sender = ScriptedSender::succeeding().with_latency(Duration::from_millis(50));
    let config = DispatchConfig { worker_count: 4, ..Default::default() };
    let harness = Harness::new(sender, config);

    let messages = (1..=10).map(|tag| Ok(account_message(tag))).collect::<Vec<_>>();
    let end =
        harness.dispatcher.clone().run(stream::iter(messages), CancellationToken::new()).await?;

    assert!(matches!(end, SessionEnd::ConnectionLost { .. }));
    assert_eq!(harness.sender.call_count(), 10);
    assert_eq!(harness.sender.max_in_flight(), 4);
    assert_eq!(harness.acker.ack_count(), 10);
    Ok(())
}

#[tokio::test]
async fn redelivered_message_starts_a_fresh_attempt_counter() {
    let mut script = server_errors(3);
    script.push(Ok(relay_delivery::client::mock::ok_response()));
    let harness = Harness::new(ScriptedSender::with_script(script), DispatchConfig::default());

    let first = harness.dispatcher.handle(account_message(1)).await;
    let second = harness.dispatcher.handle(account_message(2).with_delivery_count(1)).await;

    assert_eq!(first, Disposition::Requeue);
    assert_eq!(second, Disposition::Ack);
    let attempts =
        harness.sender.calls().iter().map(|(_, ctx)| ctx.attempt_number).collect::<Vec<_>>();
    assert_eq!(attempts, vec![1, 2, 3, 1]);
}

#[tokio::test]
async fn message_past_redelivery_ceiling_is_dead_lettered() {
    let config = DispatchConfig { max_redeliveries: 2, ..Default::default() };
    let harness = Harness::new(ScriptedSender::failing(), config);

    // One message on a classic queue: first delivery, then two redeliveries.
    let deliveries =
        [account_message(1), account_message(2).redelivery(), account_message(3).redelivery()];
    let mut dispositions = Vec::new();
    for message in deliveries {
        dispositions.push(harness.dispatcher.handle(message).await);
    }

    assert_eq!(dispositions, vec![
        Disposition::Requeue,
        Disposition::Requeue,
        Disposition::DeadLetter
    ]);
    assert_eq!(harness.acker.nack_count(true), 2);
    assert_eq!(harness.acker.settlements_for(DeliveryHandle(3)), vec![Settlement::DeadLetter(
        DeliveryHandle(3)
    )]);
    assert_eq!(harness.stats().await.dead_lettered, 1);
}

#[tokio::test]
async fn fresh_messages_with_same_body_are_always_requeued() {
    let config = DispatchConfig { max_redeliveries: 2, ..Default::default() };
    let harness = Harness::new(ScriptedSender::failing(), config);

    let mut dispositions = Vec::new();
    for tag in 1..=5 {
        dispositions.push(harness.dispatcher.handle(account_message(tag)).await);
    }

    assert_eq!(dispositions, vec![Disposition::Requeue; 5]);
    assert_eq!(harness.acker.nack_count(true), 5);
    assert_eq!(harness.acker.dead_letter_count(), 0);
}

#[tokio::test]
async fn broker_delivery_count_counts_toward_ceiling() {
    let config = DispatchConfig { max_redeliveries: 2, ..Default::default() };
    let harness = Harness::new(ScriptedSender::failing(), config);

    let message = account_message(9).with_message_id("order-9").with_delivery_count(2);
    let disposition = harness.dispatcher.handle(message).await;

    assert_eq!(disposition, Disposition::DeadLetter);
    assert_eq!(harness.acker.settlements(), vec![Settlement::DeadLetter(DeliveryHandle(9))]);
}

#[tokio::test]
async fn every_message_settled_exactly_once() -> Result<()> {
    let mut script = server_errors(4);
    script.push(Err(DeliveryError::network("connection reset")));
    let config = DispatchConfig { worker_count: 3, ..Default::default() };
    let harness = Harness::new(ScriptedSender::with_script(script), config);

    let messages = (1..=20)
        .map(|tag| {
            if tag % 5 == 0 {
                Ok(QueueMessage::new(tag, "not json"))
            } else {
                Ok(account_message(tag))
            }
        })
        .collect::<Vec<_>>();

    harness.dispatcher.clone().run(stream::iter(messages), CancellationToken::new()).await?;

    for tag in 1..=20 {
        let settlements = harness.acker.settlements_for(DeliveryHandle(tag));
        assert_eq!(settlements.len(), 1, "delivery {tag} settled {} times", settlements.len());
    }
    let stats = harness.stats().await;
    assert_eq!(stats.received, 20);
    assert_eq!(stats.settled(), 20);
    assert_eq!(stats.rejected, 4);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn stream_error_ends_session_after_draining() -> Result<()> {
    let harness = Harness::new(ScriptedSender::succeeding(), DispatchConfig::default());

    let items = vec![
        Ok(account_message(1)),
        Ok(account_message(2)),
        Err(BrokerError::consume("channel closed by broker")),
        Ok(account_message(3)),
    ];
    let end =
        harness.dispatcher.clone().run(stream::iter(items), CancellationToken::new()).await?;

    match end {
        SessionEnd::ConnectionLost { reason } => assert!(reason.contains("channel closed")),
        SessionEnd::Shutdown => panic!("stream error should end the session as lost"),
    }
    assert_eq!(harness.acker.ack_count(), 2);
    assert!(harness.acker.settlements_for(DeliveryHandle(3)).is_empty());
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_in_flight_messages() -> Result<()> {
    let sender = ScriptedSender::succeeding().with_latency(Duration::from_millis(30));
    let harness = Harness::new(sender, DispatchConfig::default());
    let cancel = CancellationToken::new();

    let messages = (1..=4).map(|tag| Ok(account_message(tag))).collect::<Vec<_>>();
    let deliveries = stream::iter(messages).chain(stream::pending()).boxed();
    let run = tokio::spawn(harness.dispatcher.clone().run(deliveries, cancel.clone()));

    while harness.stats().await.received < 4 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();

    let end = run.await??;

    assert_eq!(end, SessionEnd::Shutdown);
    assert_eq!(harness.acker.ack_count(), 4);
    assert_eq!(harness.stats().await.active_workers, 0);
    Ok(())
}
