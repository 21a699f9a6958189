//! Error types for broker-side operations.
//!
//! Connection and topology errors stop the process; everything that goes
//! wrong while handling a single message is logged and turned into an
//! ack/nack decision instead of being returned.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised while talking to the broker or running the consume loop.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Broker unreachable or connection handshake failed.
    #[error("broker connection failed: {message}")]
    Connection {
        /// Error message describing the connection failure
        message: String,
    },

    /// Channel could not be opened on an established connection.
    #[error("channel creation failed: {message}")]
    Channel {
        /// Error message from the broker client
        message: String,
    },

    /// Queue declaration or QoS setup rejected by the broker.
    #[error("topology setup failed for {queue}: {message}")]
    Topology {
        /// Queue being declared or configured
        queue: String,
        /// Error message from the broker client
        message: String,
    },

    /// Starting the consumer or reading from it failed.
    #[error("consume failed: {message}")]
    Consume {
        /// Error message from the broker client
        message: String,
    },

    /// An ack or nack could not be sent.
    #[error("acknowledgment of delivery {delivery_tag} failed: {message}")]
    Acknowledgment {
        /// Broker delivery tag of the message
        delivery_tag: u64,
        /// Error message from the broker client
        message: String,
    },

    /// Message body is not a valid JSON document.
    #[error("payload is not valid JSON: {message}")]
    Decode {
        /// Parser error message
        message: String,
    },

    /// Workers did not drain within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },
}

impl BrokerError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel { message: message.into() }
    }

    /// Creates a topology error for `queue`.
    pub fn topology(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology { queue: queue.into(), message: message.into() }
    }

    /// Creates a consume error.
    pub fn consume(message: impl Into<String>) -> Self {
        Self::Consume { message: message.into() }
    }

    /// Creates an acknowledgment error.
    pub fn acknowledgment(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgment { delivery_tag, message: message.into() }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Whether the error must terminate the process rather than trigger a
    /// reconnect.
    ///
    /// Connection and channel failures only reach the caller after the
    /// connect retries are used up, and a topology mismatch will not fix
    /// itself by reconnecting.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Channel { .. } | Self::Topology { .. } => true,

            Self::Consume { .. }
            | Self::Acknowledgment { .. }
            | Self::Decode { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}
