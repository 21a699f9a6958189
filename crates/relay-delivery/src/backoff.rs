//! Exponential backoff between downstream delivery attempts.
//!
//! The policy is a pure function of the attempt number: it either says to
//! retry after a delay or to stop. It holds no per-message state, so one
//! policy value is shared by every in-flight delivery.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Default number of delivery attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default growth factor applied per attempt.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default upper bound for a single delay: none, delays grow unbounded.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::MAX;

/// Backoff policy for downstream delivery.
///
/// `max_attempts` counts every call to the downstream endpoint, the initial
/// one included: with the default of 3 the endpoint is called at most three
/// times and the orchestrator waits twice (1000ms, then 2000ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of delivery attempts (including initial attempt).
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub min_timeout: Duration,

    /// Multiplier applied to the delay for each further attempt.
    pub factor: f64,

    /// Maximum delay between attempts, `Duration::MAX` for no cap.
    pub max_timeout: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            factor: DEFAULT_FACTOR,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            jitter_factor: 0.0,
        }
    }
}

/// Result of consulting the policy after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait `delay`, then make the next attempt.
    Retry {
        /// How long to wait before the next attempt
        delay: Duration,
    },
    /// Stop retrying.
    Stop {
        /// Reason why no further attempt is made
        reason: String,
    },
}

impl BackoffPolicy {
    /// Creates a policy with the given ceiling and timing, without jitter.
    pub fn new(max_attempts: u32, min_timeout: Duration, factor: f64) -> Self {
        Self { max_attempts, min_timeout, factor, ..Default::default() }
    }

    /// Policy used when (re)connecting to the broker.
    ///
    /// Delays: 1s, 2s, 4s, ... capped at 30s.
    pub fn reconnect(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_timeout: Duration::from_secs(1),
            factor: 2.0,
            max_timeout: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }

    /// Decides what follows a failed attempt numbered `attempt_number`
    /// (1-based).
    ///
    /// Returns `Stop` once `attempt_number >= max_attempts`.
    pub fn next(&self, attempt_number: u32) -> BackoffDecision {
        if attempt_number >= self.max_attempts {
            return BackoffDecision::Stop {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        BackoffDecision::Retry { delay: self.delay_for(attempt_number) }
    }

    /// Delay to wait after failed attempt `attempt_number`, jitter included.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let delay = self.base_delay(attempt_number);
        let jittered = apply_jitter(delay, self.jitter_factor);
        std::cmp::min(jittered, self.max_timeout)
    }

    /// `min_timeout * factor^(attempt_number - 1)`, capped at `max_timeout`.
    pub fn base_delay(&self, attempt_number: u32) -> Duration {
        let exponent = i32::try_from(attempt_number.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.min_timeout.as_secs_f64() * self.factor.powi(exponent);

        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => std::cmp::min(delay, self.max_timeout),
            Err(_) => self.max_timeout,
        }
    }

    /// Checks that the policy can produce a sane delay sequence.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for a zero attempt ceiling,
    /// a factor below 1.0 (delays would shrink), a cap below the minimum, or a
    /// jitter factor outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be greater than 0"));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(DeliveryError::configuration("backoff factor must be at least 1.0"));
        }
        if self.max_timeout < self.min_timeout {
            return Err(DeliveryError::configuration(
                "max_timeout must not be smaller than min_timeout",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor percentage. For example, with
/// jitter_factor=0.25, a 10s delay becomes 7.5s to 12.5s randomly.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::try_from_secs_f64(jittered_secs.max(0.0)).unwrap_or(duration)
}
