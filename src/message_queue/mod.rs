use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MessageQueueError {
    #[error("publish failed: {0}")]
    PublishError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Transport seam between the outbox publisher and the bus. Keyed publishes
/// preserve per-key ordering on partitioned brokers; concrete adapters
/// (Kafka, AMQP) live with the deployment, not in the engine.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &Value)
        -> Result<(), MessageQueueError>;
}

/// A message as observed by a consumer of the in-memory queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredMessage {
    pub topic: String,
    pub key: String,
    pub payload: Value,
}

/// Capture-only queue used by tests and local runs. `set_failing(true)` makes
/// every publish fail, which is how delivery retry paths are exercised.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    messages: Mutex<Vec<DeliveredMessage>>,
    fail_publishes: AtomicBool,
    fail_budget: AtomicU32,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes.store(failing, Ordering::SeqCst);
    }

    /// Fails exactly the next `count` publishes, then recovers.
    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }

    /// Everything published so far, in publish order.
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.messages.lock().expect("queue lock poisoned").clone()
    }

    /// Delivered messages for one partition key, in publish order.
    pub fn delivered_for_key(&self, key: &str) -> Vec<DeliveredMessage> {
        self.delivered()
            .into_iter()
            .filter(|m| m.key == key)
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &Value,
    ) -> Result<(), MessageQueueError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(MessageQueueError::PublishError(
                "in-memory queue is in failure mode".to_string(),
            ));
        }
        if self
            .fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MessageQueueError::PublishError(
                "in-memory queue injected failure".to_string(),
            ));
        }
        debug!(topic, key, "message published");
        self.messages
            .lock()
            .expect("queue lock poisoned")
            .push(DeliveredMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn captures_messages_in_order() {
        let queue = InMemoryMessageQueue::new();
        queue.publish("t", "k1", &json!({"n": 1})).await.unwrap();
        queue.publish("t", "k2", &json!({"n": 2})).await.unwrap();
        queue.publish("t", "k1", &json!({"n": 3})).await.unwrap();

        let all = queue.delivered();
        assert_eq!(all.len(), 3);
        let k1 = queue.delivered_for_key("k1");
        assert_eq!(k1.len(), 2);
        assert_eq!(k1[0].payload, json!({"n": 1}));
        assert_eq!(k1[1].payload, json!({"n": 3}));
    }

    #[tokio::test]
    async fn failure_mode_rejects_publishes() {
        let queue = InMemoryMessageQueue::new();
        queue.set_failing(true);
        let err = queue.publish("t", "k", &json!({})).await;
        assert!(err.is_err());
        assert!(queue.delivered().is_empty());

        queue.set_failing(false);
        queue.publish("t", "k", &json!({})).await.unwrap();
        assert_eq!(queue.delivered().len(), 1);
    }
}
