//! In-process event bus

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{BusError, BusSubscription, EventBus};

/// In-process implementation of [`EventBus`]
///
/// Subscribers are unbounded channels registered per channel name; dead
/// receivers are pruned on the next publish.
pub struct MemoryBus {
    channels: DashMap<String, Vec<mpsc::UnboundedSender<serde_json::Value>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Number of live subscribers on a channel (for tests)
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<(), BusError> {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(BusSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("execution:e1").await.unwrap();

        bus.publish("execution:e1", serde_json::json!({"type": "finished"}))
            .await
            .unwrap();
        bus.publish("execution:other", serde_json::json!({"type": "finished"}))
            .await
            .unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.get("type").and_then(|v| v.as_str()), Some("finished"));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("c").await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 1);

        drop(sub);
        bus.publish("c", serde_json::json!(1)).await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        bus.publish("empty", serde_json::json!(null)).await.unwrap();
    }
}
