//! Signal delivery
//!
//! External signals land in slots within the target execution's step
//! results. The best waiting slot receives the payload; with no waiter the
//! payload is buffered into the next free overflow slot so a future
//! `wait_for_signal` consumes deliveries in arrival order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::audit::AuditLogger;
use crate::error::EngineError;
use crate::persistence::{AuditEntry, AuditKind, SlotState, StepResult, Store};

use super::runner::ExecutionRunner;

/// Hard cap on the overflow scan; beyond this something is looping
const MAX_SIGNAL_SLOTS: u32 = 10_000;

/// Slot preference: base first, then numeric overflow slots by index, then
/// custom named slots lexicographically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SlotRank {
    Base,
    Numeric(u32),
    Custom(String),
}

/// Delivers external signals into executions
pub struct SignalHandler {
    store: Arc<dyn Store>,
    runner: Arc<ExecutionRunner>,
    audit: AuditLogger,
    lock_ttl: Duration,
}

impl SignalHandler {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<ExecutionRunner>,
        audit: AuditLogger,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            audit,
            lock_ttl,
        }
    }

    /// Deliver a signal payload to an execution
    ///
    /// Serialized per execution by the `signal:<id>` advisory lock; callers
    /// racing on the same execution get a lock-contention error and retry.
    #[instrument(skip(self, payload))]
    pub async fn deliver(
        &self,
        execution_id: &str,
        signal_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let resource = format!("signal:{execution_id}");
        let Some(lock_id) = self.store.acquire_lock(&resource, self.lock_ttl).await? else {
            return Err(EngineError::LockContention(resource));
        };

        let outcome = self.deliver_locked(execution_id, signal_id, payload).await;

        if let Err(err) = self.store.release_lock(&resource, &lock_id).await {
            warn!(%resource, error = %err, "failed to release signal lock");
        }

        outcome
    }

    async fn deliver_locked(
        &self,
        execution_id: &str,
        signal_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        let attempt = execution.as_ref().map(|e| e.attempt).unwrap_or(0);

        let results = self.store.list_step_results(execution_id).await?;
        let base = format!("__signal:{signal_id}");
        let numeric_prefix = format!("{base}:");

        let mut waiting: Vec<(SlotRank, String, Option<String>)> = Vec::new();
        let mut occupied_indices: HashSet<u32> = HashSet::new();

        for result in &results {
            if !result.step_id.starts_with("__signal:") {
                continue;
            }

            let rank = if result.step_id == base {
                Some(SlotRank::Base)
            } else {
                result
                    .step_id
                    .strip_prefix(&numeric_prefix)
                    .and_then(|rest| rest.parse::<u32>().ok())
                    .map(SlotRank::Numeric)
            };

            let state = match SlotState::decode(&result.result) {
                Some(state) => state,
                None if rank.is_some() => {
                    return Err(EngineError::Invariant(
                        "Invalid signal step state".to_string(),
                    ));
                }
                // A foreign slot we cannot interpret is not ours to judge
                None => continue,
            };

            match rank {
                Some(SlotRank::Base) => {
                    occupied_indices.insert(0);
                }
                Some(SlotRank::Numeric(n)) => {
                    occupied_indices.insert(n);
                }
                _ => {}
            }

            match (&rank, state) {
                (Some(r), SlotState::Waiting { timer_id, .. }) => {
                    waiting.push((r.clone(), result.step_id.clone(), timer_id));
                }
                (
                    None,
                    SlotState::Waiting {
                        signal_id: Some(tagged),
                        timer_id,
                    },
                ) if tagged == signal_id => {
                    waiting.push((
                        SlotRank::Custom(result.step_id.clone()),
                        result.step_id.clone(),
                        timer_id,
                    ));
                }
                _ => {}
            }
        }

        waiting.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some((rank, slot_id, timer_id)) = waiting.into_iter().next() {
            debug!(%execution_id, signal_id, %slot_id, ?rank, "delivering signal to waiting slot");

            self.store
                .save_step_result(StepResult::new(
                    execution_id,
                    &slot_id,
                    SlotState::Completed { payload }.encode(),
                ))
                .await?;

            if let Some(timer_id) = timer_id {
                self.store.delete_timer(&timer_id).await?;
            }

            self.audit
                .append(
                    AuditEntry::new(execution_id, attempt, AuditKind::SignalDelivered)
                        .with_signal(signal_id)
                        .with_step(&slot_id),
                )
                .await;

            return self.trigger_resume(execution_id, execution.is_some()).await;
        }

        // No waiter: buffer into the first free overflow slot
        for n in 0..=MAX_SIGNAL_SLOTS {
            if occupied_indices.contains(&n) {
                continue;
            }

            let slot_id = if n == 0 {
                base.clone()
            } else {
                format!("{base}:{n}")
            };

            debug!(%execution_id, signal_id, %slot_id, "buffering signal");

            self.store
                .save_step_result(StepResult::new(
                    execution_id,
                    &slot_id,
                    SlotState::Completed { payload }.encode(),
                ))
                .await?;

            self.audit
                .append(
                    AuditEntry::new(execution_id, attempt, AuditKind::SignalDelivered)
                        .with_signal(signal_id)
                        .with_step(&slot_id)
                        .with_message("buffered"),
                )
                .await;

            return self.trigger_resume(execution_id, execution.is_some()).await;
        }

        Err(EngineError::Invariant("Too many signal slots".to_string()))
    }

    /// Resume the execution after a slot mutation
    ///
    /// Signals to missing executions write the slot for later but never
    /// trigger a resume; terminal executions are left alone.
    async fn trigger_resume(
        &self,
        execution_id: &str,
        exists: bool,
    ) -> Result<(), EngineError> {
        if !exists {
            return Ok(());
        }
        match self.store.get_execution(execution_id).await? {
            Some(execution) if !execution.is_terminal() => self.runner.resume(execution_id).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::engine::registry::TaskRegistry;
    use crate::engine::runner::RunnerConfig;
    use crate::persistence::{
        Execution, ExecutionPatch, ExecutionStatus, MemoryStore, Namespace, Timer,
    };
    use crate::queue::{MemoryQueue, Queue, QueueMessage};
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        handler: SignalHandler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let namespace = Namespace::default();
        let audit = AuditLogger::new(dyn_store.clone(), None, namespace.clone());
        let runner = Arc::new(ExecutionRunner::new(
            dyn_store.clone(),
            Arc::new(TaskRegistry::new()),
            Some(queue.clone() as Arc<dyn Queue>),
            None,
            audit.clone(),
            namespace,
            RunnerConfig::default(),
        ));
        let handler = SignalHandler::new(dyn_store, runner, audit, Duration::from_secs(30));
        Fixture {
            store,
            queue,
            handler,
        }
    }

    async fn seed_sleeping_execution(store: &MemoryStore, id: &str) {
        let mut execution = Execution::new(id, "task", Value::Null, 1, None);
        execution.status = ExecutionStatus::Sleeping;
        store.save_execution(execution).await.unwrap();
    }

    async fn write_slot(store: &MemoryStore, execution_id: &str, slot_id: &str, state: SlotState) {
        store
            .save_step_result(StepResult::new(execution_id, slot_id, state.encode()))
            .await
            .unwrap();
    }

    async fn slot_state(store: &MemoryStore, execution_id: &str, slot_id: &str) -> SlotState {
        let result = store
            .get_step_result(execution_id, slot_id)
            .await
            .unwrap()
            .unwrap();
        SlotState::decode(&result.result).unwrap()
    }

    #[tokio::test]
    async fn test_overflow_buffering_in_order() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        write_slot(
            &f.store,
            "e1",
            "__signal:paid",
            SlotState::Completed {
                payload: serde_json::json!({"n": 1}),
            },
        )
        .await;

        f.handler
            .deliver("e1", "paid", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid:1").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 2})
            }
        );
        // The base slot is untouched
        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 1})
            }
        );

        f.handler
            .deliver("e1", "paid", serde_json::json!({"n": 3}))
            .await
            .unwrap();
        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid:2").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 3})
            }
        );
    }

    #[tokio::test]
    async fn test_base_slot_preferred_over_custom() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        write_slot(
            &f.store,
            "e1",
            "__signal:paid",
            SlotState::Waiting {
                signal_id: None,
                timer_id: None,
            },
        )
        .await;
        write_slot(
            &f.store,
            "e1",
            "__signal:stable-paid",
            SlotState::Waiting {
                signal_id: Some("paid".to_string()),
                timer_id: None,
            },
        )
        .await;

        f.handler
            .deliver("e1", "paid", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 1})
            }
        );
        assert!(slot_state(&f.store, "e1", "__signal:stable-paid")
            .await
            .is_waiting());
    }

    #[tokio::test]
    async fn test_smallest_numeric_slot_preferred() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        write_slot(
            &f.store,
            "e1",
            "__signal:paid:2",
            SlotState::Waiting {
                signal_id: None,
                timer_id: None,
            },
        )
        .await;
        write_slot(
            &f.store,
            "e1",
            "__signal:paid:1",
            SlotState::Waiting {
                signal_id: None,
                timer_id: None,
            },
        )
        .await;

        f.handler
            .deliver("e1", "paid", serde_json::json!({"first": true}))
            .await
            .unwrap();

        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid:1").await,
            SlotState::Completed {
                payload: serde_json::json!({"first": true})
            }
        );
        assert!(slot_state(&f.store, "e1", "__signal:paid:2").await.is_waiting());
    }

    #[tokio::test]
    async fn test_delivery_cancels_timeout_timer_and_resumes() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;

        let timer = Timer::signal_timeout("e1", "__signal:paid:1", Utc::now());
        let timer_id = timer.id.clone();
        f.store.create_timer(timer).await.unwrap();
        write_slot(
            &f.store,
            "e1",
            "__signal:paid:1",
            SlotState::Waiting {
                signal_id: None,
                timer_id: Some(timer_id.clone()),
            },
        )
        .await;

        f.handler
            .deliver("e1", "paid", serde_json::json!({"n": 9}))
            .await
            .unwrap();

        assert_eq!(
            slot_state(&f.store, "e1", "__signal:paid:1").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 9})
            }
        );
        assert_eq!(f.store.pending_timer_count(), 0);

        // A resume message was enqueued for the sleeping execution
        let delivery = f.queue.receive().await.unwrap().unwrap();
        assert_eq!(
            delivery.message(),
            &QueueMessage::Resume {
                execution_id: "e1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_signal_to_missing_execution_buffers_without_resume() {
        let f = fixture();

        f.handler
            .deliver("ghost", "paid", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(
            slot_state(&f.store, "ghost", "__signal:paid").await,
            SlotState::Completed {
                payload: serde_json::json!({"n": 1})
            }
        );
        assert_eq!(f.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_terminal_execution_not_resumed() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        f.store
            .update_execution(
                "e1",
                ExecutionPatch {
                    status: Some(ExecutionStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        f.handler
            .deliver("e1", "paid", serde_json::json!(1))
            .await
            .unwrap();
        assert_eq!(f.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_invalid_slot_state_rejected() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        f.store
            .save_step_result(StepResult::new(
                "e1",
                "__signal:paid",
                serde_json::json!({"state": "garbled", "what": 1}),
            ))
            .await
            .unwrap();

        let result = f.handler.deliver("e1", "paid", Value::Null).await;
        match result {
            Err(EngineError::Invariant(message)) => {
                assert_eq!(message, "Invalid signal step state");
            }
            other => panic!("expected invariant violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lock_contention_fails_fast() {
        let f = fixture();
        seed_sleeping_execution(&f.store, "e1").await;
        f.store
            .acquire_lock("signal:e1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let result = f.handler.deliver("e1", "paid", Value::Null).await;
        assert!(matches!(result, Err(EngineError::LockContention(_))));
    }

    #[test]
    fn test_slot_rank_ordering() {
        let mut ranks = vec![
            SlotRank::Custom("zz".to_string()),
            SlotRank::Numeric(2),
            SlotRank::Custom("aa".to_string()),
            SlotRank::Base,
            SlotRank::Numeric(1),
        ];
        ranks.sort();
        assert_eq!(
            ranks,
            vec![
                SlotRank::Base,
                SlotRank::Numeric(1),
                SlotRank::Numeric(2),
                SlotRank::Custom("aa".to_string()),
                SlotRank::Custom("zz".to_string()),
            ]
        );
    }
}
