//! HTTP client for downstream delivery with configurable timeouts.
//!
//! One call to `send` is one POST to the downstream endpoint. Retrying is
//! the orchestrator's job; the client only reports what happened.

use std::{future::Future, pin::Pin, time::Duration};

use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Response bodies larger than this are truncated before being kept.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Configuration for the downstream delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Destination URL receiving the JSON payloads.
    pub url: String,
    /// Timeout for a single HTTP request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/contas".to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "queue-relay/0.1".to_string(),
        }
    }
}

/// Metadata attached to one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// Identifier shared by every attempt for the same message.
    pub delivery_id: Uuid,
    /// Attempt number (1-based).
    pub attempt_number: u32,
}

impl AttemptContext {
    /// Context for the first attempt of a fresh delivery.
    pub fn first() -> Self {
        Self { delivery_id: Uuid::new_v4(), attempt_number: 1 }
    }

    /// Same delivery, next attempt.
    #[must_use]
    pub fn next_attempt(self) -> Self {
        Self { attempt_number: self.attempt_number + 1, ..self }
    }
}

/// Successful (2xx) answer from the downstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body (limited size).
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// Single-shot delivery of a JSON payload.
///
/// Implemented by `DeliveryClient` for real HTTP and by `mock::ScriptedSender`
/// for tests that need to script failures.
pub trait PayloadSender: Send + Sync + 'static {
    /// Sends `payload` once.
    ///
    /// Any non-2xx response or transport failure is an `Err`.
    fn send<'a>(
        &'a self,
        payload: &'a Value,
        context: AttemptContext,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryResponse>> + Send + 'a>>;
}

/// HTTP client posting payloads to the downstream endpoint.
///
/// Uses reqwest's connection pooling, so one instance is shared by all
/// workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the URL is not absolute
    /// or the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        reqwest::Url::parse(&config.url).map_err(|e| {
            DeliveryError::configuration(format!("invalid downstream URL {}: {e}", config.url))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Posts the payload to the configured URL.
    ///
    /// # Errors
    ///
    /// - `NetworkError` for connection failures
    /// - `Timeout` for request timeouts
    /// - `ClientError` for 4xx responses
    /// - `ServerError` for 5xx responses
    /// - `UnexpectedStatus` for anything else outside 2xx
    pub async fn deliver(
        &self,
        payload: &Value,
        context: AttemptContext,
    ) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "downstream_delivery",
            delivery_id = %context.delivery_id,
            url = %self.config.url,
            attempt = context.attempt_number
        );

        async move {
            tracing::debug!("posting payload downstream");

            let request = self
                .client
                .post(&self.config.url)
                .json(payload)
                .header("X-Relay-Delivery-Id", context.delivery_id.to_string())
                .header("X-Relay-Attempt", context.attempt_number.to_string());

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            if !is_success {
                tracing::warn!(
                    status = status_code,
                    duration_ms = duration.as_millis(),
                    "downstream rejected payload"
                );
                return Err(DeliveryError::from_status(status_code, body));
            }

            tracing::info!(
                status = status_code,
                duration_ms = duration.as_millis(),
                response = %body,
                "payload delivered"
            );

            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

impl PayloadSender for DeliveryClient {
    fn send<'a>(
        &'a self,
        payload: &'a Value,
        context: AttemptContext,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryResponse>> + Send + 'a>> {
        Box::pin(self.deliver(payload, context))
    }
}

/// Reads a response body, truncating oversized ones.
async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let suffix = "... (truncated)";
        let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
        format!("{truncated}{suffix}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

pub mod mock {
    //! Scripted sender for testing retry and dispatch logic.
    //!
    //! Returns queued results in order and records every payload it was
    //! asked to send, without touching the network.

    use std::{
        collections::VecDeque,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use serde_json::Value;

    use super::{AttemptContext, DeliveryResponse, PayloadSender};
    use crate::error::{DeliveryError, Result};

    /// Sender returning scripted results.
    ///
    /// Once the script is exhausted every further call uses the fallback
    /// result (success unless `failing` was used). An optional latency makes
    /// calls overlap so tests can observe concurrency.
    #[derive(Debug, Clone)]
    pub struct ScriptedSender {
        script: Arc<Mutex<VecDeque<Result<DeliveryResponse>>>>,
        fallback: Result<DeliveryResponse>,
        calls: Arc<Mutex<Vec<(Value, AttemptContext)>>>,
        latency: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ScriptedSender {
        /// Sender that always succeeds.
        pub fn succeeding() -> Self {
            Self::with_fallback(Ok(ok_response()))
        }

        /// Sender that always fails with a 503.
        pub fn failing() -> Self {
            Self::with_fallback(Err(DeliveryError::server_error(503, "unavailable")))
        }

        /// Sender that returns `results` in order, then succeeds.
        pub fn with_script(results: Vec<Result<DeliveryResponse>>) -> Self {
            let sender = Self::succeeding();
            if let Ok(mut script) = sender.script.lock() {
                script.extend(results);
            }
            sender
        }

        fn with_fallback(fallback: Result<DeliveryResponse>) -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                fallback,
                calls: Arc::new(Mutex::new(Vec::new())),
                latency: Duration::ZERO,
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Makes every call take `latency` of real time.
        #[must_use]
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        /// Number of `send` calls so far.
        pub fn call_count(&self) -> usize {
            self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
        }

        /// Payloads and contexts of every call, in order.
        pub fn calls(&self) -> Vec<(Value, AttemptContext)> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        /// Highest number of calls that were outstanding at the same time.
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    /// A 200 response with an empty JSON body.
    pub fn ok_response() -> DeliveryResponse {
        DeliveryResponse { status_code: 200, body: "{}".to_string(), duration: Duration::ZERO }
    }

    impl PayloadSender for ScriptedSender {
        fn send<'a>(
            &'a self,
            payload: &'a Value,
            context: AttemptContext,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryResponse>> + Send + 'a>> {
            Box::pin(async move {
                if let Ok(mut calls) = self.calls.lock() {
                    calls.push((payload.clone(), context));
                }

                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(current, Ordering::SeqCst);

                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }

                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
                scripted.unwrap_or_else(|| self.fallback.clone())
            })
        }
    }
}
