//! Event bus contract for completion notifications and workflow events
//!
//! The bus is best-effort: waiters always keep a polling fallback, and
//! publish failures never block workflow progress. Channels carry
//! namespace-scoped names (`durable:<ns>:execution:<id>`,
//! `durable:<ns>:event:<event>`).

mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryBus;

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus has been shut down
    #[error("bus closed")]
    Closed,

    /// Transport-level failure
    #[error("bus error: {0}")]
    Transport(String),
}

/// A live subscription to one channel
///
/// Dropping the subscription unsubscribes; there is no explicit close.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl BusSubscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<serde_json::Value>) -> Self {
        Self { rx }
    }

    /// Wait for the next message; `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription").finish()
    }
}

/// Publish/subscribe fan-out on string channels
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish a message to all current subscribers of a channel
    async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<(), BusError>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
}
