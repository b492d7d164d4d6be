//! Queue contract for dispatching work to workers
//!
//! The queue is optional: without one the engine runs kickoff and resume
//! inline on the caller's task. With one, `execute`/`resume` messages are
//! delivered at-least-once to exactly one consumer, and the kickoff-failsafe
//! timer covers lost enqueues.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryQueue;

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue has been shut down
    #[error("queue closed")]
    Closed,

    /// Transport-level failure
    #[error("queue error: {0}")]
    Transport(String),
}

/// Messages delivered to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// First attempt of a freshly started execution
    Execute { execution_id: String },

    /// Wake a sleeping or retrying execution
    Resume { execution_id: String },
}

impl QueueMessage {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Execute { execution_id } | Self::Resume { execution_id } => execution_id,
        }
    }
}

/// A message handed to a consumer; must be settled with `ack` or `nack`
pub struct QueueDelivery {
    message: QueueMessage,
    requeue: Option<tokio::sync::mpsc::UnboundedSender<QueueMessage>>,
}

impl QueueDelivery {
    pub(crate) fn new(
        message: QueueMessage,
        requeue: Option<tokio::sync::mpsc::UnboundedSender<QueueMessage>>,
    ) -> Self {
        Self { message, requeue }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    /// Settle the delivery successfully
    pub fn ack(self) {}

    /// Reject the delivery, optionally putting the message back on the queue
    pub fn nack(self, requeue: bool) -> Result<(), QueueError> {
        if !requeue {
            return Ok(());
        }
        match self.requeue {
            Some(tx) => tx.send(self.message).map_err(|_| QueueError::Closed),
            None => Err(QueueError::Closed),
        }
    }
}

impl std::fmt::Debug for QueueDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDelivery")
            .field("message", &self.message)
            .finish()
    }
}

/// At-least-once delivery of execution messages to workers
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Publish a message
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Wait for the next message; `None` when the queue is closed
    ///
    /// Each message goes to exactly one receiver. The returned delivery must
    /// be settled; dropping it without `ack`/`nack` counts as an ack.
    async fn receive(&self) -> Result<Option<QueueDelivery>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let message = QueueMessage::Resume {
            execution_id: "e1".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("resume"));

        let parsed: QueueMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.execution_id(), "e1");
    }
}
