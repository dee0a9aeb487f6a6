//! Message bus contract.
//!
//! The broker itself is an external system. The dispatcher only needs
//! [`MessagePublisher`]; consumers of inbound events need
//! [`MessageSubscriber`]. Both must be safe to share across tasks.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{BusError, Message};

/// A stream of deliveries for one topic.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

type Redeliver = Box<dyn FnOnce(Message) + Send + Sync>;

/// A message received from a subscription.
///
/// A delivery must be settled with [`Delivery::ack`] once it has been handled
/// or [`Delivery::nack`] to have it delivered again. Dropping an unsettled
/// delivery acks it.
pub struct Delivery {
    topic: String,
    message: Message,
    redeliver: Option<Redeliver>,
}

impl Delivery {
    /// Creates a delivery that is redelivered through `redeliver` on nack.
    pub fn new(
        topic: impl Into<String>,
        message: Message,
        redeliver: impl FnOnce(Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            message,
            redeliver: Some(Box::new(redeliver)),
        }
    }

    /// The topic the message was received on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The received message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Marks the message as handled.
    pub fn ack(self) {}

    /// Returns the message to the subscription for another attempt.
    pub fn nack(mut self) {
        if let Some(redeliver) = self.redeliver.take() {
            redeliver(self.message.clone());
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Publishes messages to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Sends one message. Returns once the broker has accepted it.
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;
}

/// Subscribes to a topic.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Opens a subscription to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError>;
}
