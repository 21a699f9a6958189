//! AMQP connection, topology and consumer setup.

use std::{future::Future, pin::Pin};

use futures::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use crate::{
    ack::Acknowledger,
    error::{BrokerError, Result},
    message::{DeliveryHandle, QueueMessage},
};

/// Reply code sent with a normal channel or connection close.
const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Connection and topology settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Queue consumed by the relay.
    pub queue: String,
    /// Queue receiving messages past the redelivery ceiling, `None` when
    /// messages are requeued forever.
    pub dead_letter_queue: Option<String>,
    /// Maximum unacknowledged deliveries held by this consumer.
    pub prefetch: u16,
    /// Consumer tag announced to the broker.
    pub consumer_tag: String,
    /// Connection name shown in the broker's management UI.
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            queue: "contas_queue".to_string(),
            dead_letter_queue: Some("contas_queue.dead-letter".to_string()),
            prefetch: 4,
            consumer_tag: "queue-relay".to_string(),
            connection_name: "queue-relay".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Queues declared on connect, the dead-letter queue first.
    ///
    /// Every queue is declared durable and without arguments, so a queue
    /// that producers already declared the same way is accepted as is.
    pub fn queue_declarations(&self) -> Vec<&str> {
        self.dead_letter_queue
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.queue.as_str()))
            .collect()
    }
}

/// An open connection with one channel.
pub struct ConnectionManager {
    connection: Connection,
    channel: Channel,
    config: BrokerConfig,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("queue", &self.config.queue)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Opens a connection and a channel.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connection` if the broker is unreachable or
    /// rejects the handshake, `BrokerError::Channel` if no channel opens.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.as_str().into());

        let connection = Connection::connect(&config.url, properties)
            .await
            .map_err(|e| BrokerError::connection(e.to_string()))?;

        connection.on_error(|error| {
            warn!(error = %error, "broker connection error");
        });

        let channel =
            connection.create_channel().await.map_err(|e| BrokerError::channel(e.to_string()))?;

        if config.dead_letter_queue.is_some() {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BrokerError::channel(e.to_string()))?;
        }

        info!(queue = %config.queue, channel_id = channel.id(), "connected to broker");

        Ok(Self { connection, channel, config })
    }

    /// Declares the dead-letter queue (if any) and the main queue.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Topology` if the broker rejects a declaration,
    /// for example when the queue exists with different flags.
    pub async fn declare_topology(&self) -> Result<()> {
        for queue in self.config.queue_declarations() {
            self.declare_queue(queue).await?;
        }
        Ok(())
    }

    /// Declares one durable queue. Idempotent when the queue already exists
    /// as a durable queue without arguments.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Topology` on rejection.
    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };

        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::topology(name, e.to_string()))?;

        debug!(queue = name, messages = queue.message_count(), "queue declared");
        Ok(())
    }

    /// Limits unacknowledged deliveries on the channel.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Topology` if the broker rejects the QoS request.
    pub async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::topology(&self.config.queue, e.to_string()))?;

        debug!(prefetch = count, "prefetch set");
        Ok(())
    }

    /// Starts consuming with manual acknowledgment.
    ///
    /// The stream yields an error item when the channel fails and ends when
    /// the consumer is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Consume` if the consumer cannot be registered.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, Result<QueueMessage>>> {
        let options = BasicConsumeOptions { no_ack: false, ..BasicConsumeOptions::default() };

        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::consume(e.to_string()))?;

        info!(
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            "consuming"
        );

        Ok(consumer
            .map(|item| {
                item.map(QueueMessage::from_delivery)
                    .map_err(|e| BrokerError::consume(e.to_string()))
            })
            .boxed())
    }

    /// Stops the broker from sending new deliveries to this consumer.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Consume` if the cancel is rejected.
    pub async fn cancel_consumer(&self) -> Result<()> {
        self.channel
            .basic_cancel(&self.config.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::consume(e.to_string()))
    }

    /// Acknowledger bound to this connection's channel.
    pub fn acknowledger(&self) -> ChannelAcknowledger {
        ChannelAcknowledger {
            channel: self.channel.clone(),
            dead_letter_queue: self.config.dead_letter_queue.clone(),
        }
    }

    /// Whether both the connection and the channel are open.
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Closes the channel and the connection.
    ///
    /// Unacknowledged deliveries are returned to the queue by the broker.
    /// Close failures on an already-dead connection are logged, not returned.
    pub async fn close(self) {
        if self.channel.status().connected() {
            if let Err(error) = self.channel.close(REPLY_SUCCESS, "relay shutting down").await {
                debug!(error = %error, "channel close failed");
            }
        }
        if self.connection.status().connected() {
            if let Err(error) = self.connection.close(REPLY_SUCCESS, "relay shutting down").await {
                debug!(error = %error, "connection close failed");
            }
        }
        info!(queue = %self.config.queue, "broker connection closed");
    }
}

/// Acknowledger sending `basic.ack` / `basic.nack` on a lapin channel.
///
/// Dead-lettering publishes the body to the dead-letter queue through the
/// default exchange, waits for the publisher confirm, then acks the
/// original. The consumed queue needs no dead-letter arguments.
#[derive(Clone)]
pub struct ChannelAcknowledger {
    channel: Channel,
    dead_letter_queue: Option<String>,
}

impl ChannelAcknowledger {
    async fn publish_dead_letter(
        &self,
        queue: &str,
        message: &QueueMessage,
    ) -> std::result::Result<(), String> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());
        if let Some(message_id) = &message.message_id {
            properties = properties.with_message_id(message_id.as_str().into());
        }
        let options = BasicPublishOptions { mandatory: true, ..BasicPublishOptions::default() };

        let confirm = self
            .channel
            .basic_publish("", queue, options, &message.payload, properties)
            .await
            .map_err(|e| e.to_string())?;

        match confirm.await.map_err(|e| e.to_string())? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_)) => Err(format!("no queue named {queue}")),
            Confirmation::Nack(_) => Err("publish nacked by broker".to_string()),
        }
    }
}

impl Acknowledger for ChannelAcknowledger {
    fn ack(&self, handle: DeliveryHandle) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.channel
                .basic_ack(handle.delivery_tag(), BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::acknowledgment(handle.delivery_tag(), e.to_string()))
        })
    }

    fn nack(
        &self,
        handle: DeliveryHandle,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.channel
                .basic_nack(handle.delivery_tag(), BasicNackOptions { multiple: false, requeue })
                .await
                .map_err(|e| BrokerError::acknowledgment(handle.delivery_tag(), e.to_string()))
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let delivery_tag = message.handle.delivery_tag();
            let Some(queue) = &self.dead_letter_queue else {
                return self.nack(message.handle, false).await;
            };

            if let Err(reason) = self.publish_dead_letter(queue, message).await {
                warn!(
                    delivery_tag,
                    queue = %queue,
                    reason = %reason,
                    "dead-letter publish failed, requeueing"
                );
                self.nack(message.handle, true).await?;
                return Err(BrokerError::acknowledgment(
                    delivery_tag,
                    format!("dead-letter publish to {queue} failed: {reason}"),
                ));
            }

            debug!(delivery_tag, queue = %queue, "message moved to dead-letter queue");
            self.ack(message.handle).await
        })
    }
}
