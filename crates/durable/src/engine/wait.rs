//! Waiting on execution results
//!
//! External callers block on an execution reaching a terminal state. When an
//! event bus is available the `execution:<id>` channel short-cuts the wait;
//! polling always runs underneath because the bus is best-effort. The
//! subscription is dropped on every exit path, which unsubscribes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::bus::EventBus;
use crate::error::{DurableExecutionError, EngineError};
use crate::persistence::{ErrorInfo, Execution, ExecutionStatus, Namespace, Store};

/// Options for [`WaitManager::wait`]
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,

    /// Polling cadence while no bus event arrives
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(500),
        }
    }
}

enum WaitState {
    Ready(Value),
    Failed(DurableExecutionError),
    Pending,
}

/// Resolves execution results for external waiters
pub struct WaitManager {
    store: Arc<dyn Store>,
    bus: Option<Arc<dyn EventBus>>,
    namespace: Namespace,
}

impl WaitManager {
    pub fn new(store: Arc<dyn Store>, bus: Option<Arc<dyn EventBus>>, namespace: Namespace) -> Self {
        Self {
            store,
            bus,
            namespace,
        }
    }

    /// Wait for an execution to finish
    ///
    /// Resolves with the result on completion; fails with a
    /// [`DurableExecutionError`] on failure or cancellation, and on timeout
    /// (a missing execution at the deadline reports `task_id = "unknown"`).
    #[instrument(skip(self, options))]
    pub async fn wait(
        &self,
        execution_id: &str,
        options: WaitOptions,
    ) -> Result<Value, EngineError> {
        let started = tokio::time::Instant::now();

        let mut subscription = match &self.bus {
            Some(bus) => {
                let channel = self.namespace.scoped(&format!("execution:{execution_id}"));
                match bus.subscribe(&channel).await {
                    Ok(subscription) => Some(subscription),
                    Err(err) => {
                        // Degrade to pure polling
                        warn!(%channel, error = %err, "bus subscription failed");
                        None
                    }
                }
            }
            None => None,
        };

        loop {
            if let Some(execution) = self.store.get_execution(execution_id).await? {
                match classify(&execution) {
                    WaitState::Ready(result) => return Ok(result),
                    WaitState::Failed(err) => return Err(err.into()),
                    WaitState::Pending => {}
                }
            }

            let sleep_for = match options.timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(self.timeout_error(execution_id).await.into());
                    }
                    (timeout - elapsed).min(options.poll_interval)
                }
                None => options.poll_interval,
            };

            let mut subscription_gone = false;
            match subscription.as_mut() {
                Some(active) => {
                    tokio::select! {
                        event = active.recv() => {
                            // A closed channel degrades to pure polling
                            subscription_gone = event.is_none();
                            debug!(%execution_id, "wait woken by bus event");
                        }
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
                None => tokio::time::sleep(sleep_for).await,
            }
            if subscription_gone {
                subscription = None;
            }
        }
    }

    /// Build the timeout error, tolerating store failures on the final fetch
    async fn timeout_error(&self, execution_id: &str) -> DurableExecutionError {
        match self.store.get_execution(execution_id).await {
            Ok(Some(execution)) => DurableExecutionError {
                execution_id: execution_id.to_string(),
                task_id: execution.task_id,
                attempt: execution.attempt,
                cause: ErrorInfo::new("timed out waiting for execution result"),
            },
            _ => DurableExecutionError::unknown(execution_id, "timed out waiting for execution result"),
        }
    }
}

fn classify(execution: &Execution) -> WaitState {
    match execution.status {
        ExecutionStatus::Completed => {
            WaitState::Ready(execution.result.clone().unwrap_or(Value::Null))
        }
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
            WaitState::Failed(DurableExecutionError {
                execution_id: execution.id.clone(),
                task_id: execution.task_id.clone(),
                attempt: execution.attempt,
                cause: execution
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::new("execution failed")),
            })
        }
        _ => WaitState::Pending,
    }
}
