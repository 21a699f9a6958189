//! Retry loop for a single message.
//!
//! The orchestrator calls the sender, consults the backoff policy after each
//! failure and sleeps between attempts. The attempt counter is local to one
//! `deliver` call, so a message redelivered by the broker starts again at
//! attempt 1.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    backoff::{BackoffDecision, BackoffPolicy},
    client::{AttemptContext, DeliveryResponse, PayloadSender},
    error::{DeliveryError, ErrorCategory},
    time::Clock,
};

/// Final result of delivering one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The downstream endpoint accepted the payload.
    Succeeded {
        /// Number of calls made, the successful one included.
        attempts: u32,
        /// The accepting response.
        response: DeliveryResponse,
    },
    /// Every allowed attempt failed.
    Exhausted {
        /// Number of calls made.
        attempts: u32,
        /// Failure of the final attempt.
        last_error: DeliveryError,
    },
}

impl DeliveryOutcome {
    /// Whether the payload reached the endpoint.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Number of downstream calls made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Drives a `PayloadSender` under a `BackoffPolicy`.
#[derive(Clone)]
pub struct DeliveryOrchestrator {
    sender: Arc<dyn PayloadSender>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeliveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryOrchestrator")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl DeliveryOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        sender: Arc<dyn PayloadSender>,
        policy: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { sender, policy, clock }
    }

    /// Delivers `payload`, retrying until success or until the policy stops.
    ///
    /// Never calls the sender more than `policy.max_attempts` times.
    pub async fn deliver(&self, payload: &Value) -> DeliveryOutcome {
        let mut context = AttemptContext::first();

        loop {
            debug!(
                delivery_id = %context.delivery_id,
                attempt = context.attempt_number,
                "attempting downstream delivery"
            );

            let error = match self.sender.send(payload, context).await {
                Ok(response) => {
                    return DeliveryOutcome::Succeeded {
                        attempts: context.attempt_number,
                        response,
                    };
                },
                Err(error) => error,
            };

            match self.policy.next(context.attempt_number) {
                BackoffDecision::Retry { delay } => {
                    warn!(
                        delivery_id = %context.delivery_id,
                        attempt = context.attempt_number,
                        category = %ErrorCategory::from(&error),
                        status_code = error.status_code(),
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "delivery attempt failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                    context = context.next_attempt();
                },
                BackoffDecision::Stop { reason } => {
                    error!(
                        delivery_id = %context.delivery_id,
                        attempts = context.attempt_number,
                        category = %ErrorCategory::from(&error),
                        status_code = error.status_code(),
                        error = %error,
                        reason = %reason,
                        "delivery exhausted"
                    );
                    return DeliveryOutcome::Exhausted {
                        attempts: context.attempt_number,
                        last_error: error,
                    };
                },
            }
        }
    }
}
