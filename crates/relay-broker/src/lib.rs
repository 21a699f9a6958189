//! Broker side of the relay: consume, dispatch, settle.
//!
//! The supervisor owns the AMQP connection and reconnects when it drops.
//! Each connection runs one consume session in which the dispatcher feeds a
//! bounded worker pool; every message is settled exactly once.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  ┌───────────────────┐  ┌────────────┐  ┌──────────────────────┐
//! │ Supervisor │─▶│ ConnectionManager │─▶│ Dispatcher │─▶│ WorkerPool (N tasks) │
//! └────────────┘  └───────────────────┘  └────────────┘  └──────────────────────┘
//!                                              │                     │
//!                                              ▼                     ▼
//!                                     ┌──────────────────┐ ┌──────────────────────┐
//!                                     │ RedeliveryLedger │ │ DeliveryOrchestrator │
//!                                     └──────────────────┘ └──────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod message;
pub mod supervisor;
pub mod worker_pool;

pub use ack::{Acknowledger, Disposition};
pub use connection::{BrokerConfig, ChannelAcknowledger, ConnectionManager};
pub use dispatcher::{DispatchConfig, DispatchStats, Dispatcher, SessionEnd};
pub use error::{BrokerError, Result};
pub use ledger::RedeliveryLedger;
pub use message::{DeliveryHandle, QueueMessage};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker_pool::WorkerPool;
