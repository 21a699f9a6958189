//! Integration tests for delivery against a real HTTP endpoint.
//!
//! Drives the orchestrator through the reqwest client against a wiremock
//! server, with a test clock so backoff waits are recorded instead of slept.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use relay_delivery::{
    BackoffPolicy, ClientConfig, DeliveryClient, DeliveryError, DeliveryOrchestrator,
    DeliveryOutcome, TestClock,
};
use serde_json::{json, Value};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn account_payload() -> Value {
    json!({"branch": 1, "number": 100})
}

fn orchestrator_for(server: &MockServer, clock: &TestClock) -> Result<DeliveryOrchestrator> {
    let client = DeliveryClient::new(ClientConfig {
        url: format!("{}/contas", server.uri()),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })?;

    Ok(DeliveryOrchestrator::new(
        Arc::new(client),
        BackoffPolicy::default(),
        Arc::new(clock.clone()),
    ))
}

#[tokio::test]
async fn delivers_on_first_attempt() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/contas"))
        .and(matchers::header("content-type", "application/json"))
        .and(matchers::body_json(account_payload()))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let outcome = orchestrator_for(&server, &clock)?.deliver(&account_payload()).await;

    assert!(outcome.is_succeeded());
    assert_eq!(outcome.attempts(), 1);
    assert!(clock.recorded_sleeps().is_empty());
    Ok(())
}

#[tokio::test]
async fn recovers_on_third_attempt_after_two_waits() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let outcome = orchestrator_for(&server, &clock)?.deliver(&account_payload()).await;

    match outcome {
        DeliveryOutcome::Succeeded { attempts, response } => {
            assert_eq!(attempts, 3);
            assert_eq!(response.body, "ok");
        },
        DeliveryOutcome::Exhausted { .. } => panic!("third attempt should succeed"),
    }
    assert_eq!(clock.recorded_sleeps(), vec![
        Duration::from_millis(1000),
        Duration::from_millis(2000)
    ]);
    Ok(())
}

#[tokio::test]
async fn exhausts_after_three_failed_attempts() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
        .expect(3)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let outcome = orchestrator_for(&server, &clock)?.deliver(&account_payload()).await;

    assert_eq!(outcome, DeliveryOutcome::Exhausted {
        attempts: 3,
        last_error: DeliveryError::server_error(500, "db down"),
    });
    Ok(())
}

#[tokio::test]
async fn validation_rejections_are_retried_like_any_failure() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("missing holderName"))
        .expect(3)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let outcome = orchestrator_for(&server, &clock)?.deliver(&json!({"branch": 1})).await;

    assert!(!outcome.is_succeeded());
    assert_eq!(outcome.attempts(), 3);
    Ok(())
}

#[tokio::test]
async fn slow_endpoint_times_out() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = DeliveryClient::new(ClientConfig {
        url: format!("{}/contas", server.uri()),
        timeout: Duration::from_millis(100),
        ..Default::default()
    })?;
    let clock = TestClock::new();
    let orchestrator = DeliveryOrchestrator::new(
        Arc::new(client),
        BackoffPolicy { max_attempts: 1, ..Default::default() },
        Arc::new(clock),
    );

    let outcome = orchestrator.deliver(&account_payload()).await;

    assert!(matches!(outcome, DeliveryOutcome::Exhausted {
        attempts: 1,
        last_error: DeliveryError::Timeout { .. }
    }));
    Ok(())
}

#[tokio::test]
async fn redelivery_starts_a_fresh_attempt_counter() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(3)
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::header("X-Relay-Attempt", "1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let orchestrator = orchestrator_for(&server, &clock)?;

    let first = orchestrator.deliver(&account_payload()).await;
    let second = orchestrator.deliver(&account_payload()).await;

    assert_eq!(first.attempts(), 3);
    assert!(!first.is_succeeded());
    assert!(second.is_succeeded());
    assert_eq!(second.attempts(), 1);
    Ok(())
}
