//! Downstream delivery with bounded exponential backoff.
//!
//! This crate turns one decoded queue message into one `DeliveryOutcome`.
//! It knows nothing about the broker: the caller decides what to do with the
//! outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌────────────────┐   ┌─────────────┐
//! │ DeliveryOrchestrator │──▶│ PayloadSender  │──▶│ Downstream  │
//! └──────────────────────┘   │ (HTTP client)  │   │ endpoint    │
//!            │               └────────────────┘   └─────────────┘
//!            ▼
//!   ┌────────────────┐
//!   │ BackoffPolicy  │
//!   └────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_delivery::{
//!     BackoffPolicy, ClientConfig, DeliveryClient, DeliveryError, DeliveryOrchestrator, RealClock,
//! };
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let client = DeliveryClient::new(ClientConfig::default())?;
//! let orchestrator =
//!     DeliveryOrchestrator::new(Arc::new(client), BackoffPolicy::default(), Arc::new(RealClock));
//!
//! let outcome = orchestrator.deliver(&serde_json::json!({"branch": 1, "number": 100})).await;
//! println!("delivered: {}", outcome.is_succeeded());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod orchestrator;
pub mod time;

pub use backoff::{BackoffDecision, BackoffPolicy, DEFAULT_MAX_TIMEOUT};
pub use client::{AttemptContext, ClientConfig, DeliveryClient, DeliveryResponse, PayloadSender};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use orchestrator::{DeliveryOrchestrator, DeliveryOutcome};
pub use time::{Clock, RealClock, TestClock};

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
