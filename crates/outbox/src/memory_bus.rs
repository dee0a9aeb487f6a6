use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, mpsc};

use crate::bus::{Delivery, DeliveryStream, MessagePublisher, MessageSubscriber};
use crate::{BusError, Message};

#[derive(Default)]
struct BrokerState {
    log: Vec<(String, Message)>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    failing_publishes: usize,
    fail_on_publish: bool,
}

/// In-memory message broker for tests and local runs.
///
/// - Every published message is kept in a log, in publish order
/// - A new subscription first receives the topic's history, then live messages
/// - Every subscription gets every message of its topic
/// - A nacked delivery is queued again on the same subscription
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.failing_publishes = count;
    }

    /// Makes every publish fail until switched off.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.state.lock().await.fail_on_publish = fail;
    }

    /// Returns every accepted message with its topic, in publish order.
    pub async fn published(&self) -> Vec<(String, Message)> {
        self.state.lock().await.log.clone()
    }

    /// Returns the accepted messages of one topic, in publish order.
    pub async fn published_to(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Returns the number of accepted messages.
    pub async fn published_count(&self) -> usize {
        self.state.lock().await.log.len()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        let mut state = self.state.lock().await;

        if state.fail_on_publish || state.failing_publishes > 0 {
            state.failing_publishes = state.failing_publishes.saturating_sub(1);
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        state.log.push((topic.to_string(), message.clone()));

        if let Some(subs) = state.subscribers.get_mut(topic) {
            // Drop subscriptions whose stream has gone away
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }

        Ok(())
    }
}

#[async_trait]
impl MessageSubscriber for InMemoryBroker {
    async fn subscribe(&self, topic: &str) -> Result<DeliveryStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.state.lock().await;
            for (_, message) in state.log.iter().filter(|(t, _)| t == topic) {
                let _ = tx.send(message.clone());
            }
            state
                .subscribers
                .entry(topic.to_string())
                .or_default()
                .push(tx.clone());
        }

        let topic = topic.to_string();
        let deliveries = stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            let requeue = tx.clone();
            async move {
                let message = rx.recv().await?;
                let delivery = Delivery::new(topic, message, move |m| {
                    let _ = requeue.send(m);
                });
                Some((delivery, rx))
            }
        });

        Ok(Box::pin(deliveries))
    }
}
