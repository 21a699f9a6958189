//! Settlement of delivered messages.
//!
//! Every message handed to the dispatcher is settled exactly once through an
//! `Acknowledger`: an ack when the downstream accepted it, a nack when it is
//! requeued or rejected, and a publish to the dead-letter queue followed by
//! an ack past the redelivery ceiling.

use std::{future::Future, pin::Pin};

use crate::{
    error::Result,
    message::{DeliveryHandle, QueueMessage},
};

/// Final decision for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Downstream accepted the payload; remove it from the queue.
    Ack,
    /// Delivery exhausted its attempts; put it back on the queue.
    Requeue,
    /// Payload cannot be decoded; drop it without requeueing.
    Reject,
    /// Redelivery ceiling reached; move it to the dead-letter queue.
    DeadLetter,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Requeue => write!(f, "requeue"),
            Self::Reject => write!(f, "reject"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// Sends acks and nacks to the broker.
pub trait Acknowledger: Send + Sync + 'static {
    /// Positively acknowledges the delivery.
    fn ack(&self, handle: DeliveryHandle) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Negatively acknowledges the delivery.
    fn nack(
        &self,
        handle: DeliveryHandle,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves the message to the dead-letter queue and removes it from the
    /// consumed queue.
    fn dead_letter<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Settles the message according to `disposition`.
    fn settle<'a>(
        &'a self,
        message: &'a QueueMessage,
        disposition: Disposition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        match disposition {
            Disposition::Ack => self.ack(message.handle),
            Disposition::Requeue => self.nack(message.handle, true),
            Disposition::Reject => self.nack(message.handle, false),
            Disposition::DeadLetter => self.dead_letter(message),
        }
    }
}

/// In-memory acknowledger for tests.
pub mod mock {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::BrokerError;

    /// A settlement call observed by `RecordingAcknowledger`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Settlement {
        /// `ack` was called.
        Ack(DeliveryHandle),
        /// `nack` was called with the given requeue flag.
        Nack {
            /// Delivery that was nacked.
            handle: DeliveryHandle,
            /// Requeue flag passed to the broker.
            requeue: bool,
        },
        /// `dead_letter` was called.
        DeadLetter(DeliveryHandle),
    }

    impl Settlement {
        /// Delivery the settlement refers to.
        pub fn handle(&self) -> DeliveryHandle {
            match self {
                Self::Ack(handle) | Self::Nack { handle, .. } | Self::DeadLetter(handle) => {
                    *handle
                },
            }
        }
    }

    /// Records every ack, nack and dead-letter in call order.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingAcknowledger {
        settlements: Arc<Mutex<Vec<Settlement>>>,
        fail: bool,
    }

    impl RecordingAcknowledger {
        /// Creates an acknowledger that accepts every call.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates an acknowledger whose calls are recorded but fail, as on a
        /// closed channel.
        pub fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        /// All settlements so far.
        pub fn settlements(&self) -> Vec<Settlement> {
            self.settlements.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
        }

        /// Settlements recorded for one delivery.
        pub fn settlements_for(&self, handle: DeliveryHandle) -> Vec<Settlement> {
            self.settlements().into_iter().filter(|s| s.handle() == handle).collect()
        }

        /// Number of acks.
        pub fn ack_count(&self) -> usize {
            self.settlements().iter().filter(|s| matches!(s, Settlement::Ack(_))).count()
        }

        /// Number of messages moved to the dead-letter queue.
        pub fn dead_letter_count(&self) -> usize {
            self.settlements().iter().filter(|s| matches!(s, Settlement::DeadLetter(_))).count()
        }

        /// Number of nacks with the given requeue flag.
        pub fn nack_count(&self, requeue: bool) -> usize {
            self.settlements()
                .iter()
                .filter(|s| matches!(s, Settlement::Nack { requeue: r, .. } if *r == requeue))
                .count()
        }

        fn record(&self, settlement: Settlement) -> Result<()> {
            self.settlements
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(settlement);

            if self.fail {
                let delivery_tag = settlement.handle().delivery_tag();
                Err(BrokerError::acknowledgment(delivery_tag, "channel closed"))
            } else {
                Ok(())
            }
        }
    }

    impl Acknowledger for RecordingAcknowledger {
        fn ack(
            &self,
            handle: DeliveryHandle,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move { self.record(Settlement::Ack(handle)) })
        }

        fn nack(
            &self,
            handle: DeliveryHandle,
            requeue: bool,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move { self.record(Settlement::Nack { handle, requeue }) })
        }

        fn dead_letter<'a>(
            &'a self,
            message: &'a QueueMessage,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move { self.record(Settlement::DeadLetter(message.handle)) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        mock::{RecordingAcknowledger, Settlement},
        *,
    };

    #[tokio::test]
    async fn settle_routes_each_disposition() {
        let acker = RecordingAcknowledger::new();

        for (tag, disposition) in [
            (1, Disposition::Ack),
            (2, Disposition::Requeue),
            (3, Disposition::Reject),
            (4, Disposition::DeadLetter),
        ] {
            acker.settle(&QueueMessage::new(tag, "{}"), disposition).await.unwrap();
        }

        assert_eq!(acker.settlements(), vec![
            Settlement::Ack(DeliveryHandle(1)),
            Settlement::Nack { handle: DeliveryHandle(2), requeue: true },
            Settlement::Nack { handle: DeliveryHandle(3), requeue: false },
            Settlement::DeadLetter(DeliveryHandle(4)),
        ]);
    }

    #[tokio::test]
    async fn failing_acknowledger_still_records() {
        let acker = RecordingAcknowledger::failing();

        let result = acker.ack(DeliveryHandle(5)).await;

        assert!(result.is_err());
        assert_eq!(acker.ack_count(), 1);
    }
}
