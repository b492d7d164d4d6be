//! Engine facade
//!
//! [`DurableEngine`] wires the store, queue, bus, registry, and managers
//! together with explicit dependencies (no cyclic references) and exposes the
//! public API: starting and waiting on executions, signals, cancellation,
//! schedules, recovery, and the polling-loop lifecycle.

mod registry;
mod runner;
mod signal;
mod wait;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::bus::EventBus;
use crate::context::{FlowNode, TaskContext};
use crate::error::{EngineError, TaskError};
use crate::persistence::{
    AuditEntry, ErrorInfo, Execution, ExecutionFilter, ExecutionPatch, Namespace, Store, Timer,
};
use crate::queue::Queue;
use crate::schedule::{ScheduleChange, ScheduleManager, ScheduleSpec};
use crate::task::Task;
use crate::worker::{PollerConfig, TimerDispatcher, TimerPoller};

pub use registry::{AnyTask, TaskRegistry};
pub use runner::{ExecutionRunner, RunnerConfig};
pub use signal::SignalHandler;
pub use wait::{WaitManager, WaitOptions};

/// Engine-wide configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `max_attempts` when start options leave it unset
    pub default_max_attempts: u32,

    /// Base delay for retry backoff (`base * 2^(attempt-1)`)
    pub retry_base: Duration,

    /// TTL of the per-execution advisory lock
    pub execution_lock_ttl: Duration,

    /// TTL of the per-execution signal-delivery lock
    pub signal_lock_ttl: Duration,

    /// TTL of the per-schedule lock
    pub schedule_lock_ttl: Duration,

    /// Delay before a queued kickoff's failsafe timer fires
    pub kickoff_grace: Duration,

    /// Timer poll interval
    pub poll_interval: Duration,

    /// TTL of per-timer claim leases
    pub claim_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 1,
            retry_base: Duration::from_secs(1),
            execution_lock_ttl: Duration::from_secs(30),
            signal_lock_ttl: Duration::from_secs(30),
            schedule_lock_ttl: Duration::from_secs(30),
            kickoff_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_kickoff_grace(mut self, grace: Duration) -> Self {
        self.kickoff_grace = grace;
        self
    }
}

/// Options for starting an execution
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Total wall-clock budget across all attempts
    pub timeout: Option<Duration>,

    /// Attempts before the execution fails terminally
    pub max_attempts: Option<u32>,

    /// Deduplicate starts: the same (task, key) returns the first execution
    pub idempotency_key: Option<String>,

    /// Poll cadence used by `start_and_wait`
    pub wait_poll_interval: Option<Duration>,
}

/// Builder for [`DurableEngine`]
pub struct EngineBuilder {
    store: Arc<dyn Store>,
    queue: Option<Arc<dyn Queue>>,
    bus: Option<Arc<dyn EventBus>>,
    namespace: String,
    config: EngineConfig,
    registry: TaskRegistry,
}

impl EngineBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            queue: None,
            bus: None,
            namespace: "default".to_string(),
            config: EngineConfig::default(),
            registry: TaskRegistry::new(),
        }
    }

    /// Tenant namespace; prefixes all keys, queue names, and bus channels
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a task handler instance
    pub fn register<T: Task>(mut self, task: T) -> Self {
        self.registry.register(task);
        self
    }

    pub fn build(self) -> Result<DurableEngine, EngineError> {
        let namespace = Namespace::new(&self.namespace)
            .map_err(|err| EngineError::Validation(err.to_string()))?;

        let registry = Arc::new(self.registry);
        let audit = AuditLogger::new(self.store.clone(), self.bus.clone(), namespace.clone());

        let runner = Arc::new(ExecutionRunner::new(
            self.store.clone(),
            registry.clone(),
            self.queue.clone(),
            self.bus.clone(),
            audit.clone(),
            namespace.clone(),
            RunnerConfig {
                lock_ttl: self.config.execution_lock_ttl,
                retry_base: self.config.retry_base,
                kickoff_grace: self.config.kickoff_grace,
                default_max_attempts: self.config.default_max_attempts,
            },
        ));

        let schedules = Arc::new(ScheduleManager::new(
            self.store.clone(),
            self.config.schedule_lock_ttl,
        ));

        let signals = SignalHandler::new(
            self.store.clone(),
            runner.clone(),
            audit.clone(),
            self.config.signal_lock_ttl,
        );

        let waits = WaitManager::new(self.store.clone(), self.bus.clone(), namespace.clone());

        let dispatcher = Arc::new(TimerDispatcher::new(
            self.store.clone(),
            runner.clone(),
            schedules.clone(),
            audit.clone(),
        ));

        let worker_id = Uuid::now_v7().to_string();
        let poller = TimerPoller::new(
            self.store.clone(),
            dispatcher.clone(),
            worker_id,
            PollerConfig {
                interval: self.config.poll_interval,
                claim_ttl: self.config.claim_ttl,
            },
        );

        let (consumer_shutdown, _) = watch::channel(false);

        Ok(DurableEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                queue: self.queue,
                namespace,
                config: self.config,
                registry,
                audit,
                runner,
                schedules,
                signals,
                waits,
                dispatcher,
                poller,
                consumer: Mutex::new(None),
                consumer_shutdown,
            }),
        })
    }
}

struct EngineInner {
    store: Arc<dyn Store>,
    queue: Option<Arc<dyn Queue>>,
    namespace: Namespace,
    config: EngineConfig,
    registry: Arc<TaskRegistry>,
    audit: AuditLogger,
    runner: Arc<ExecutionRunner>,
    schedules: Arc<ScheduleManager>,
    signals: SignalHandler,
    waits: WaitManager,
    dispatcher: Arc<TimerDispatcher>,
    poller: TimerPoller,
    consumer: Mutex<Option<JoinHandle<()>>>,
    consumer_shutdown: watch::Sender<bool>,
}

/// The durable workflow engine
///
/// Cheap to clone; all clones share the same wiring. Many engines on
/// different processes may share one store; they coordinate through
/// advisory locks and timer claims.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(MemoryStore::new());
/// let engine = DurableEngine::builder(store)
///     .register(Onboarding)
///     .build()?;
///
/// engine.start_polling();
/// let receipt = engine.start_and_wait("onboarding", input, StartOptions::default()).await?;
/// ```
#[derive(Clone)]
pub struct DurableEngine {
    inner: Arc<EngineInner>,
}

impl DurableEngine {
    pub fn builder(store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn worker_id(&self) -> &str {
        self.inner.poller.worker_id()
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Start an execution of a registered task
    #[instrument(skip(self, input, options))]
    pub async fn start(
        &self,
        task_id: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<String, EngineError> {
        if !self.inner.registry.contains(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }

        let execution_id = Uuid::now_v7().to_string();

        if let Some(key) = &options.idempotency_key {
            let winner = self
                .inner
                .store
                .set_execution_id_by_idempotency_key(task_id, key, &execution_id)
                .await?;
            if winner != execution_id {
                info!(task_id, key = %key, existing = %winner, "idempotent start deduplicated");
                return Ok(winner);
            }
        }

        let execution = Execution::new(
            &execution_id,
            task_id,
            input,
            options
                .max_attempts
                .unwrap_or(self.inner.config.default_max_attempts),
            options.timeout.map(|t| t.as_millis() as u64),
        );
        self.inner.store.save_execution(execution).await?;

        self.inner.runner.kickoff(&execution_id).await?;
        Ok(execution_id)
    }

    /// Typed variant of [`start`](Self::start)
    pub async fn start_task<T: Task>(
        &self,
        input: T::Input,
        options: StartOptions,
    ) -> Result<String, EngineError> {
        self.start(T::ID, serde_json::to_value(input)?, options)
            .await
    }

    /// Start an execution and block until its result
    pub async fn start_and_wait(
        &self,
        task_id: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<Value, EngineError> {
        let wait_options = WaitOptions {
            timeout: options.timeout,
            poll_interval: options
                .wait_poll_interval
                .unwrap_or(WaitOptions::default().poll_interval),
        };
        let execution_id = self.start(task_id, input, options).await?;
        self.wait_with(&execution_id, wait_options).await
    }

    /// Wait for an execution's result with default options
    pub async fn wait(&self, execution_id: &str) -> Result<Value, EngineError> {
        self.wait_with(execution_id, WaitOptions::default()).await
    }

    /// Wait for an execution's result
    pub async fn wait_with(
        &self,
        execution_id: &str,
        options: WaitOptions,
    ) -> Result<Value, EngineError> {
        self.inner.waits.wait(execution_id, options).await
    }

    /// Wait and decode the result into a task's output type
    pub async fn wait_task<T: Task>(
        &self,
        execution_id: &str,
        options: WaitOptions,
    ) -> Result<T::Output, EngineError> {
        let value = self.wait_with(execution_id, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, EngineError> {
        Ok(self.inner.store.get_execution(execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.inner.store.list_executions(filter).await?)
    }

    /// Executions stuck in `compensation_failed`, awaiting an operator
    pub async fn list_stuck(&self) -> Result<Vec<Execution>, EngineError> {
        Ok(self.inner.store.list_stuck().await?)
    }

    /// Deliver an external signal to an execution
    pub async fn signal(
        &self,
        execution_id: &str,
        signal_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.inner.signals.deliver(execution_id, signal_id, payload).await
    }

    /// Request cancellation of an execution
    ///
    /// The request is durable immediately; the terminal transition happens
    /// cooperatively at the next attempt entry or step boundary. Compensations
    /// registered in a running attempt are executed best-effort.
    #[instrument(skip(self, reason))]
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.inner.store.get_execution(execution_id).await? else {
            return Err(EngineError::Validation(format!(
                "unknown execution {execution_id}"
            )));
        };
        if execution.is_terminal() {
            return Ok(());
        }

        self.inner
            .store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    cancel_requested_at: Some(Utc::now()),
                    error: reason.map(ErrorInfo::new),
                    ..Default::default()
                },
            )
            .await?;

        // Nudge sleeping executions so the request is observed promptly
        if let Err(err) = self.inner.runner.resume(execution_id).await {
            warn!(%execution_id, error = %err, "cancel resume failed; next resume applies it");
        }
        Ok(())
    }

    /// Re-kickoff every non-terminal execution (crash recovery)
    ///
    /// Idempotent: executions already being driven are protected by their
    /// advisory locks, and terminal ones are skipped by the attempt entry.
    /// Stuck (`compensation_failed`) executions are left to the operator.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let incomplete = self.inner.store.list_incomplete().await?;
        let count = incomplete.len();
        info!(count, "recovering incomplete executions");

        for execution in incomplete {
            if let Err(err) = self.inner.runner.kickoff(&execution.id).await {
                warn!(execution_id = %execution.id, error = %err, "recovery kickoff failed");
            }
        }
        Ok(count)
    }

    /// Reset a stuck execution and run its rollback again
    pub async fn retry_rollback(&self, execution_id: &str) -> Result<(), EngineError> {
        self.inner.store.retry_rollback(execution_id).await?;
        self.inner.runner.kickoff(execution_id).await
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    /// Schedule a task: one-off (`Delay`/`At`) or recurring (`Cron`/`Every`)
    pub async fn schedule(
        &self,
        task_id: &str,
        input: Option<Value>,
        spec: ScheduleSpec,
    ) -> Result<String, EngineError> {
        if !self.inner.registry.contains(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }
        self.inner.schedules.create(task_id, input, spec).await
    }

    /// Idempotently ensure a recurring schedule
    pub async fn ensure_schedule(
        &self,
        task_id: &str,
        input: Option<Value>,
        spec: ScheduleSpec,
    ) -> Result<String, EngineError> {
        if !self.inner.registry.contains(task_id) {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        }
        self.inner.schedules.ensure(task_id, input, spec).await
    }

    pub async fn pause_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        self.inner.schedules.pause(schedule_id).await
    }

    pub async fn resume_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        self.inner.schedules.resume(schedule_id).await
    }

    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        change: ScheduleChange,
    ) -> Result<(), EngineError> {
        self.inner.schedules.update(schedule_id, change).await
    }

    pub async fn remove_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        self.inner.schedules.remove(schedule_id).await
    }

    pub async fn get_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Option<crate::persistence::Schedule>, EngineError> {
        self.inner.schedules.get(schedule_id).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<crate::persistence::Schedule>, EngineError> {
        self.inner.schedules.list().await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Record the flow shape of a task without executing any user work
    pub async fn describe_flow(
        &self,
        task_id: &str,
        input: Value,
    ) -> Result<Vec<FlowNode>, EngineError> {
        let Some(task) = self.inner.registry.get(task_id) else {
            return Err(EngineError::UnknownTask(task_id.to_string()));
        };

        let ctx = TaskContext::for_recording(
            task_id,
            self.inner.store.clone(),
            self.inner.audit.clone(),
            self.inner.namespace.clone(),
        );

        // Recording ends at the first node whose placeholder the output type
        // rejects; that unwinds as a suspension
        match task.run(&ctx, input).await {
            Ok(_) | Err(TaskError::Suspended) => {}
            Err(err) => {
                warn!(task_id, error = %err, "flow recording ended early");
            }
        }

        Ok(ctx.take_recorded())
    }

    /// The audit trail of an execution
    pub async fn audit_log(
        &self,
        execution_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self
            .inner
            .store
            .list_audit_entries(execution_id, offset, limit)
            .await?)
    }

    /// Fire one timer (exposed for external drivers and tests)
    pub async fn handle_timer(&self, timer: &Timer) -> Result<(), EngineError> {
        self.inner.dispatcher.handle_timer(timer).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the timer poll loop and, when a queue is configured, the queue
    /// consumer. Idempotent.
    pub fn start_polling(&self) {
        self.inner.poller.start();

        let Some(queue) = self.inner.queue.clone() else {
            return;
        };

        let mut consumer = self.inner.consumer.lock();
        if consumer.is_some() {
            return;
        }

        let _ = self.inner.consumer_shutdown.send(false);
        let mut shutdown_rx = self.inner.consumer_shutdown.subscribe();
        let runner = self.inner.runner.clone();

        *consumer = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivery = queue.receive() => match delivery {
                        Ok(Some(delivery)) => {
                            let execution_id = delivery.message().execution_id().to_string();
                            match runner.run(&execution_id).await {
                                Ok(()) => delivery.ack(),
                                Err(err)
                                    if matches!(
                                        err,
                                        EngineError::Store(_) | EngineError::Queue(_)
                                    ) =>
                                {
                                    warn!(%execution_id, error = %err, "worker attempt failed; requeueing");
                                    if let Err(nack_err) = delivery.nack(true) {
                                        warn!(error = %nack_err, "requeue failed");
                                    }
                                }
                                Err(err) => {
                                    // Permanent errors poison the queue if requeued
                                    warn!(%execution_id, error = %err, "dropping message");
                                    delivery.ack();
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "queue receive failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the poll loop and queue consumer, letting in-flight work finish
    pub async fn stop(&self) {
        self.inner.poller.stop().await;

        let consumer = { self.inner.consumer.lock().take() };
        if let Some(consumer) = consumer {
            let _ = self.inner.consumer_shutdown.send(true);
            if let Err(err) = consumer.await {
                warn!(error = %err, "queue consumer panicked");
            }
        }
    }
}

impl std::fmt::Debug for DurableEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableEngine")
            .field("namespace", &self.inner.namespace)
            .field("worker_id", &self.inner.poller.worker_id())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ExecutionStatus, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTask;

    #[async_trait]
    impl Task for EchoTask {
        const ID: &'static str = "echo";
        type Input = Value;
        type Output = Value;

        async fn run(&self, _ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
            Ok(input)
        }
    }

    struct PipelineTask {
        charges: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for PipelineTask {
        const ID: &'static str = "pipeline";
        type Input = Value;
        type Output = Value;

        async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
            let charges = self.charges.clone();
            let amount: i64 = ctx
                .step("charge", move || async move {
                    charges.fetch_add(1, Ordering::SeqCst);
                    Ok(250)
                })
                .await?;
            ctx.note("charged").await;
            ctx.sleep(Duration::from_millis(1)).await?;
            ctx.emit("charged", serde_json::json!({ "amount": amount }))
                .await?;
            Ok(serde_json::json!({ "amount": amount }))
        }
    }

    fn engine_on(store: Arc<MemoryStore>) -> DurableEngine {
        DurableEngine::builder(store)
            .register(EchoTask)
            .register(PipelineTask {
                charges: Arc::new(AtomicUsize::new(0)),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_blank_namespace_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let result = DurableEngine::builder(store).namespace("  ").build();
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_unknown_task() {
        let engine = engine_on(Arc::new(MemoryStore::new()));
        let result = engine
            .start("ghost", Value::Null, StartOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_start_and_wait_inline() {
        let engine = engine_on(Arc::new(MemoryStore::new()));
        let result = engine
            .start_and_wait(
                "echo",
                serde_json::json!({"ping": true}),
                StartOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ping": true}));
    }

    #[tokio::test]
    async fn test_idempotency_key_deduplicates() {
        let engine = engine_on(Arc::new(MemoryStore::new()));
        let options = StartOptions {
            idempotency_key: Some("order-1".to_string()),
            ..Default::default()
        };

        let first = engine
            .start("echo", serde_json::json!(1), options.clone())
            .await
            .unwrap();
        let second = engine
            .start("echo", serde_json::json!(2), options)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancel_sleeping_execution() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_on(store.clone());

        let id = engine
            .start("pipeline", Value::Null, StartOptions::default())
            .await
            .unwrap();
        assert_eq!(
            engine.get_execution(&id).await.unwrap().unwrap().status,
            ExecutionStatus::Sleeping
        );

        engine
            .cancel_execution(&id, Some("operator said stop".to_string()))
            .await
            .unwrap();

        let execution = engine.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error.unwrap().message, "operator said stop");
        assert!(execution.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution_rejected() {
        let engine = engine_on(Arc::new(MemoryStore::new()));
        let result = engine.cancel_execution("ghost", None).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_recover_rekicks_incomplete() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_on(store.clone());

        // A sleeping execution survives recover untouched (its timer will
        // wake it), and recover reports it
        let id = engine
            .start("pipeline", Value::Null, StartOptions::default())
            .await
            .unwrap();

        let recovered = engine.recover().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(
            engine.get_execution(&id).await.unwrap().unwrap().status,
            ExecutionStatus::Sleeping
        );

        // recover is idempotent
        assert_eq!(engine.recover().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_describe_flow_records_shape() {
        let engine = engine_on(Arc::new(MemoryStore::new()));

        let shape = engine.describe_flow("pipeline", Value::Null).await.unwrap();
        assert_eq!(
            shape,
            vec![
                FlowNode::Step {
                    step_id: "charge".to_string()
                },
                FlowNode::Note {
                    message: "charged".to_string()
                },
                FlowNode::Sleep {
                    step_id: "sleep:0".to_string(),
                    duration_ms: 1
                },
                FlowNode::Emit {
                    event: "charged".to_string(),
                    step_id: "emit:0".to_string()
                },
            ]
        );

        // Recording never persisted anything
        assert!(engine
            .get_execution("__record__")
            .await
            .unwrap()
            .is_none());
    }
}
