//! In-process queue backed by an unbounded channel

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::{Queue, QueueDelivery, QueueError, QueueMessage};

/// In-process implementation of [`Queue`]
///
/// Provides the same at-least-once semantics as a broker-backed queue within
/// a single process: `nack(requeue)` puts the message back, and concurrent
/// receivers each see a message exactly once.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Number of messages currently buffered (for tests)
    pub fn depth(&self) -> usize {
        self.rx.try_lock().map(|rx| rx.len()).unwrap_or(0)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.tx.send(message).map_err(|_| QueueError::Closed)
    }

    async fn receive(&self) -> Result<Option<QueueDelivery>, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(message) => Ok(Some(QueueDelivery::new(message, Some(self.tx.clone())))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_receive() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueMessage::Execute {
                execution_id: "e1".to_string(),
            })
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.message().execution_id(), "e1");
        delivery.ack();
    }

    #[tokio::test]
    async fn test_nack_requeues() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(QueueMessage::Resume {
                execution_id: "e1".to_string(),
            })
            .await
            .unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        delivery.nack(true).unwrap();

        let redelivered = queue.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.message().execution_id(), "e1");
        redelivered.nack(false).unwrap();

        assert_eq!(queue.depth(), 0);
    }
}
