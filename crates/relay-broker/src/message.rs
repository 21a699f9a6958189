//! Queue messages as seen by the dispatcher.
//!
//! A `QueueMessage` is the broker delivery stripped down to what the relay
//! needs: the opaque body, the handle used to ack or nack it, and the few
//! properties the redelivery ledger reads.

use bytes::Bytes;
use lapin::{message::Delivery, types::AMQPValue};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{BrokerError, Result};

/// Header set by quorum queues with the number of earlier deliveries.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Broker-assigned handle of one delivery, used only to ack or nack it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub u64);

impl DeliveryHandle {
    /// AMQP delivery tag.
    pub fn delivery_tag(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Handle used to settle the message.
    pub handle: DeliveryHandle,
    /// Raw body as published.
    pub payload: Bytes,
    /// Whether the broker flagged this as a redelivery.
    pub redelivered: bool,
    /// AMQP `message_id` property, if the publisher set one.
    pub message_id: Option<String>,
    /// Broker-reported number of earlier deliveries, if available.
    pub delivery_count: Option<u32>,
}

impl QueueMessage {
    /// Creates a first-delivery message with no properties.
    pub fn new(delivery_tag: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            handle: DeliveryHandle(delivery_tag),
            payload: payload.into(),
            redelivered: false,
            message_id: None,
            delivery_count: None,
        }
    }

    /// Sets the `message_id` property.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Marks the message as redelivered, as a classic queue does, without a
    /// delivery count.
    #[must_use]
    pub fn redelivery(mut self) -> Self {
        self.redelivered = true;
        self
    }

    /// Marks the message as redelivered with the given earlier-delivery count.
    #[must_use]
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.redelivered = true;
        self.delivery_count = Some(delivery_count);
        self
    }

    /// Converts a lapin delivery.
    pub fn from_delivery(delivery: Delivery) -> Self {
        let message_id = delivery.properties.message_id().as_ref().map(|id| id.to_string());
        let delivery_count = delivery.properties.headers().as_ref().and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| amqp_value_as_u32(value))
        });

        Self {
            handle: DeliveryHandle(delivery.delivery_tag),
            payload: Bytes::from(delivery.data),
            redelivered: delivery.redelivered,
            message_id,
            delivery_count,
        }
    }

    /// Parses the body as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Decode` when the body is not valid UTF-8 JSON.
    pub fn decode(&self) -> Result<Value> {
        serde_json::from_slice(&self.payload).map_err(|e| BrokerError::decode(e.to_string()))
    }

    /// Key identifying this message across redeliveries.
    ///
    /// The publisher's `message_id` when present, otherwise a SHA-256 of the
    /// body.
    pub fn ledger_key(&self) -> String {
        match &self.message_id {
            Some(id) => format!("id:{id}"),
            None => format!("sha256:{}", hex::encode(Sha256::digest(&self.payload))),
        }
    }
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}
