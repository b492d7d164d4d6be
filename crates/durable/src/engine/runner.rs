//! Execution manager: drives one workflow attempt
//!
//! State machine per attempt:
//!
//! ```text
//! pending ──claim+run──▶ running
//! running ──success──▶ completed                       (terminal)
//! running ──suspension─▶ sleeping                      (timer armed by context)
//! running ──failure, attempt < max──▶ retrying         (retry timer armed)
//! running ──failure, attempt = max──▶ failed           (terminal)
//! running ──compensation failure──▶ compensation_failed (stuck)
//! sleeping/retrying ──resume──▶ running
//! pending/running/sleeping/retrying ──cancel──▶ cancelled (terminal)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::bus::EventBus;
use crate::context::TaskContext;
use crate::error::{EngineError, TaskError};
use crate::persistence::{
    AuditEntry, AuditKind, ErrorInfo, Execution, ExecutionPatch, ExecutionStatus, Namespace,
    Store, Timer,
};
use crate::queue::{Queue, QueueMessage};

use super::registry::TaskRegistry;

/// Configuration for the execution manager
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// TTL of the per-execution advisory lock
    pub lock_ttl: Duration,

    /// Base delay for retry backoff (`base * 2^(attempt-1)`)
    pub retry_base: Duration,

    /// How long after a queued kickoff the failsafe timer fires
    pub kickoff_grace: Duration,

    /// `max_attempts` when start options leave it unset
    pub default_max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            kickoff_grace: Duration::from_secs(30),
            default_max_attempts: 1,
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(30)))
}

/// Drives execution attempts against the store
///
/// Many workers may hold a runner over the same store; the per-execution
/// advisory lock guarantees at most one is driving a given execution at a
/// time.
pub struct ExecutionRunner {
    store: Arc<dyn Store>,
    registry: Arc<TaskRegistry>,
    queue: Option<Arc<dyn Queue>>,
    bus: Option<Arc<dyn EventBus>>,
    audit: AuditLogger,
    namespace: Namespace,
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<TaskRegistry>,
        queue: Option<Arc<dyn Queue>>,
        bus: Option<Arc<dyn EventBus>>,
        audit: AuditLogger,
        namespace: Namespace,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            bus,
            audit,
            namespace,
            config,
        }
    }

    /// Create a new execution and kick it off
    #[instrument(skip(self, input, timeout))]
    pub async fn launch(
        &self,
        task_id: &str,
        input: Value,
        max_attempts: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<String, EngineError> {
        if !self.registry.contains(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }

        let execution_id = Uuid::now_v7().to_string();
        let execution = Execution::new(
            &execution_id,
            task_id,
            input,
            max_attempts.unwrap_or(self.config.default_max_attempts),
            timeout.map(|t| t.as_millis() as u64),
        );

        self.store.save_execution(execution).await?;
        info!(%execution_id, task_id, "started execution");

        self.kickoff(&execution_id).await?;
        Ok(execution_id)
    }

    /// Hand an execution to a worker
    ///
    /// With a queue: arm the kickoff failsafe timer, then enqueue; the timer
    /// is deleted only after a successful enqueue so a lost message is
    /// recovered from storage alone. Without a queue: run inline.
    pub async fn kickoff(&self, execution_id: &str) -> Result<(), EngineError> {
        match &self.queue {
            Some(queue) => {
                let timer =
                    Timer::kickoff(execution_id, Utc::now() + chrono_ms(self.config.kickoff_grace));
                let timer_id = timer.id.clone();
                self.store.create_timer(timer).await?;

                match queue
                    .enqueue(QueueMessage::Execute {
                        execution_id: execution_id.to_string(),
                    })
                    .await
                {
                    Ok(()) => {
                        self.store.delete_timer(&timer_id).await?;
                        Ok(())
                    }
                    Err(err) => {
                        warn!(
                            %execution_id,
                            error = %err,
                            "kickoff enqueue failed; failsafe timer remains"
                        );
                        Ok(())
                    }
                }
            }
            None => self.run(execution_id).await,
        }
    }

    /// Wake a sleeping or retrying execution
    ///
    /// Enqueues a `resume` message when a queue is configured, otherwise runs
    /// the attempt inline. A failed enqueue propagates so the caller leaves
    /// the triggering timer in place for the next poll cycle.
    pub async fn resume(&self, execution_id: &str) -> Result<(), EngineError> {
        match &self.queue {
            Some(queue) => queue
                .enqueue(QueueMessage::Resume {
                    execution_id: execution_id.to_string(),
                })
                .await
                .map_err(EngineError::Queue),
            None => self.run(execution_id).await,
        }
    }

    /// Run one attempt of an execution
    #[instrument(skip(self))]
    pub async fn run(&self, execution_id: &str) -> Result<(), EngineError> {
        let resource = format!("execution:{execution_id}");
        let Some(lock_id) = self
            .store
            .acquire_lock(&resource, self.config.lock_ttl)
            .await?
        else {
            debug!(%execution_id, "execution lock held elsewhere, skipping");
            return Ok(());
        };

        let outcome = self.run_locked(execution_id).await;

        if let Err(err) = self.store.release_lock(&resource, &lock_id).await {
            warn!(%resource, error = %err, "failed to release execution lock");
        }

        outcome
    }

    async fn run_locked(&self, execution_id: &str) -> Result<(), EngineError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            warn!(%execution_id, "cannot run unknown execution");
            return Ok(());
        };

        if execution.is_terminal() {
            debug!(%execution_id, status = %execution.status, "execution already terminal");
            return Ok(());
        }

        let now = Utc::now();
        if execution.cancel_requested_at.is_some() {
            return self.finish_cancelled(execution).await;
        }
        if execution.timed_out(now) {
            return self
                .finish_failed(execution, ErrorInfo::new("execution timed out"))
                .await;
        }

        let Some(task) = self.registry.get(&execution.task_id) else {
            return Err(EngineError::UnknownTask(execution.task_id.clone()));
        };

        let execution = self
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    ..Default::default()
                },
            )
            .await?;

        let ctx = TaskContext::new(
            &execution.id,
            &execution.task_id,
            execution.attempt,
            self.store.clone(),
            self.bus.clone(),
            self.audit.clone(),
            self.namespace.clone(),
        );

        debug!(%execution_id, attempt = execution.attempt, "running attempt");

        let result = match execution.remaining_budget(now) {
            Some(budget) => {
                match tokio::time::timeout(budget, task.run(&ctx, execution.input.clone())).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TaskError::Failed(ErrorInfo::new("execution timed out"))),
                }
            }
            None => task.run(&ctx, execution.input.clone()).await,
        };

        match result {
            Ok(value) => self.finish_completed(execution, value).await,
            Err(TaskError::Suspended) => {
                self.store
                    .update_execution(
                        execution_id,
                        ExecutionPatch {
                            status: Some(ExecutionStatus::Sleeping),
                            ..Default::default()
                        },
                    )
                    .await?;
                debug!(%execution_id, "attempt suspended");
                Ok(())
            }
            Err(TaskError::Cancelled) => self.finish_cancelled(execution).await,
            Err(TaskError::CompensationFailed { step_id, .. }) => {
                // The context already persisted the stuck state and audit
                error!(%execution_id, %step_id, "execution stuck in compensation_failed");
                Ok(())
            }
            Err(TaskError::SignalTimeout { signal_id }) => {
                self.handle_failure(
                    execution,
                    ErrorInfo::new(format!("timed out waiting for signal {signal_id}")),
                )
                .await
            }
            Err(TaskError::Storage(err)) => Err(EngineError::Store(err)),
            Err(TaskError::Failed(failure)) => self.handle_failure(execution, failure).await,
        }
    }

    async fn handle_failure(
        &self,
        execution: Execution,
        failure: ErrorInfo,
    ) -> Result<(), EngineError> {
        let now = Utc::now();

        if execution.attempt >= execution.max_attempts || execution.timed_out(now) {
            return self.finish_failed(execution, failure).await;
        }

        let delay = retry_delay(self.config.retry_base, execution.attempt);
        let timer = Timer::retry(&execution.id, execution.attempt, now + chrono_ms(delay));
        let timer_id = timer.id.clone();
        self.store.create_timer(timer).await?;

        self.store
            .update_execution(
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Retrying),
                    attempt: Some(execution.attempt + 1),
                    error: Some(failure.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            execution_id = %execution.id,
            attempt = execution.attempt,
            ?delay,
            "scheduled retry"
        );

        self.audit
            .append(
                AuditEntry::new(&execution.id, execution.attempt, AuditKind::RetryScheduled)
                    .with_timer(&timer_id)
                    .with_error(failure),
            )
            .await;

        Ok(())
    }

    async fn finish_completed(
        &self,
        execution: Execution,
        result: Value,
    ) -> Result<(), EngineError> {
        let updated = self
            .store
            .update_execution(
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Completed),
                    result: Some(result),
                    clear_error: true,
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        info!(execution_id = %execution.id, "execution completed");

        self.audit
            .append(AuditEntry::new(
                &execution.id,
                execution.attempt,
                AuditKind::ExecutionCompleted,
            ))
            .await;

        self.publish_finished(&updated).await;
        Ok(())
    }

    async fn finish_failed(
        &self,
        execution: Execution,
        failure: ErrorInfo,
    ) -> Result<(), EngineError> {
        let updated = self
            .store
            .update_execution(
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    error: Some(failure.clone()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        error!(execution_id = %execution.id, error = %failure.message, "execution failed");

        self.audit
            .append(
                AuditEntry::new(&execution.id, execution.attempt, AuditKind::ExecutionFailed)
                    .with_error(failure),
            )
            .await;

        self.publish_finished(&updated).await;
        Ok(())
    }

    async fn finish_cancelled(&self, execution: Execution) -> Result<(), EngineError> {
        let now = Utc::now();
        // A reason recorded by cancel_execution wins over the generic message
        let cause = execution
            .error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new("execution cancelled"));
        let updated = self
            .store
            .update_execution(
                &execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Cancelled),
                    error: Some(cause),
                    cancelled_at: Some(now),
                    completed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        info!(execution_id = %execution.id, "execution cancelled");

        self.audit
            .append(AuditEntry::new(
                &execution.id,
                execution.attempt,
                AuditKind::ExecutionCancelled,
            ))
            .await;

        self.publish_finished(&updated).await;
        Ok(())
    }

    /// Best-effort terminal notification on `execution:<id>`
    async fn publish_finished(&self, execution: &Execution) {
        let Some(bus) = &self.bus else { return };

        let channel = self
            .namespace
            .scoped(&format!("execution:{}", execution.id));
        let message = match serde_json::to_value(execution) {
            Ok(payload) => serde_json::json!({
                "type": "finished",
                "payload": payload,
                "timestamp": Utc::now(),
            }),
            Err(err) => {
                warn!(error = %err, "failed to encode finished event");
                return;
            }
        };

        if let Err(err) = bus.publish(&channel, message).await {
            warn!(%channel, error = %err, "failed to publish finished event");
        }
    }
}

fn chrono_ms(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}
