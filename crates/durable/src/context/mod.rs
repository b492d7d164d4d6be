//! Per-execution durable context
//!
//! The [`TaskContext`] is the API handed to task handlers. Every durable
//! primitive memoizes through the store: a completed step short-circuits on
//! replay, a pending sleep or signal wait suspends the attempt by returning
//! [`TaskError::Suspended`], and the execution manager interprets that
//! unwinding as the `sleeping` transition rather than a failure.

mod recorder;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::bus::EventBus;
use crate::error::TaskError;
use crate::persistence::{
    AuditEntry, AuditKind, ErrorInfo, ExecutionPatch, ExecutionStatus, Namespace, SlotState,
    StepResult, Store, Timer,
};

pub use recorder::FlowNode;

/// Registered compensation for a completed step
struct Compensation {
    step_id: String,
    undo: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>,
}

/// One branch of a [`TaskContext::switch`]
pub struct Branch<T> {
    name: String,
    run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>,
}

impl<T> Branch<T> {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Options for [`TaskContext::wait_for_signal`]
#[derive(Debug, Clone, Default)]
pub struct SignalWaitOptions {
    /// Fail the wait with a timeout after this long
    pub timeout: Option<Duration>,

    /// Use a named slot instead of the ordinal base/overflow slots
    pub step_id: Option<String>,
}

/// Memoized record of a switch decision
#[derive(Debug, Serialize, Deserialize)]
struct SwitchOutcome {
    branch: String,
    result: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextMode {
    /// Normal durable execution
    Execute,

    /// Shape recording: user closures are never invoked
    Record,
}

/// The durable context passed to task handlers
///
/// Replay invariant: each attempt re-runs the handler from the top, and every
/// durable operation must produce the same step id in the same order.
/// Auto-derived ids (`sleep:<n>`, `emit:<n>`, signal slot ordinals) come from
/// per-context counters that advance identically on every replay.
pub struct TaskContext {
    execution_id: String,
    task_id: String,
    attempt: u32,
    store: Arc<dyn Store>,
    bus: Option<Arc<dyn EventBus>>,
    audit: AuditLogger,
    namespace: Namespace,
    compensations: Mutex<Vec<Compensation>>,
    sleep_seq: AtomicU32,
    emit_seq: AtomicU32,
    signal_seq: Mutex<HashMap<String, u32>>,
    mode: ContextMode,
    recorded: Mutex<Vec<FlowNode>>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        execution_id: impl Into<String>,
        task_id: impl Into<String>,
        attempt: u32,
        store: Arc<dyn Store>,
        bus: Option<Arc<dyn EventBus>>,
        audit: AuditLogger,
        namespace: Namespace,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            task_id: task_id.into(),
            attempt,
            store,
            bus,
            audit,
            namespace,
            compensations: Mutex::new(Vec::new()),
            sleep_seq: AtomicU32::new(0),
            emit_seq: AtomicU32::new(0),
            signal_seq: Mutex::new(HashMap::new()),
            mode: ContextMode::Execute,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// A context in shape-recording mode; no store access happens
    pub(crate) fn for_recording(
        task_id: impl Into<String>,
        store: Arc<dyn Store>,
        audit: AuditLogger,
        namespace: Namespace,
    ) -> Self {
        let mut ctx = Self::new("__record__", task_id, 1, store, None, audit, namespace);
        ctx.mode = ContextMode::Record;
        ctx
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let store: Arc<dyn Store> = Arc::new(crate::persistence::MemoryStore::new());
        let namespace = Namespace::default();
        let audit = AuditLogger::new(store.clone(), None, namespace.clone());
        Self::new("test-exec", "test-task", 1, store, None, audit, namespace)
    }

    /// Id of the execution this context belongs to
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Id of the task being run
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Current attempt number (1-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Run a named step, memoizing its result
    ///
    /// If a result for `step_id` already exists it is returned without
    /// invoking `f`. Otherwise `f` runs; a success is persisted before it is
    /// returned, a failure persists nothing and propagates.
    pub async fn step<T, F, Fut>(&self, step_id: &str, f: F) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        if self.recording() {
            self.record(FlowNode::Step {
                step_id: step_id.to_string(),
            });
            return record_placeholder();
        }

        self.check_cancelled().await?;

        if let Some(existing) = self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?
        {
            debug!(step_id, "step replayed from memoized result");
            return serde_json::from_value(existing.result).map_err(|e| decode_error(step_id, e));
        }

        match f().await {
            Ok(value) => {
                let json = serde_json::to_value(&value)
                    .map_err(|e| TaskError::Failed(ErrorInfo::new(format!(
                        "failed to encode result of step {step_id}: {e}"
                    ))))?;
                self.store
                    .save_step_result(StepResult::new(&self.execution_id, step_id, json))
                    .await?;
                self.audit_entry(AuditKind::StepCompleted, |e| e.with_step(step_id))
                    .await;
                Ok(value)
            }
            Err(err) => {
                let failure = ErrorInfo::from_anyhow(&err);
                self.audit_entry(AuditKind::StepFailed, |e| {
                    e.with_step(step_id).with_error(failure.clone())
                })
                .await;
                Err(TaskError::Failed(failure))
            }
        }
    }

    /// Run a named step and register a compensation for it
    ///
    /// The compensation is remembered on the in-memory stack for this attempt
    /// whether the step ran fresh or replayed from a memoized result, so a
    /// later [`rollback`](Self::rollback) can still undo it.
    pub async fn step_with_rollback<T, F, Fut, D, DFut>(
        &self,
        step_id: &str,
        up: F,
        down: D,
    ) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
        D: FnOnce() -> DFut + Send + 'static,
        DFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let value = self.step(step_id, up).await?;
        if !self.recording() {
            self.compensations.lock().push(Compensation {
                step_id: step_id.to_string(),
                undo: Box::new(move || Box::pin(down())),
            });
        }
        Ok(value)
    }

    /// Memoized branch selection
    ///
    /// On first execution the selector picks a branch by name (falling back
    /// to `default_branch`), the branch runs, and the chosen branch id plus
    /// its result are persisted. Replays return the stored result without
    /// evaluating the selector or any branch.
    pub async fn switch<T>(
        &self,
        step_id: &str,
        selector: impl FnOnce() -> String + Send,
        branches: Vec<Branch<T>>,
        default_branch: Option<Branch<T>>,
    ) -> Result<T, TaskError>
    where
        T: Serialize + DeserializeOwned,
    {
        if self.recording() {
            self.record(FlowNode::Switch {
                step_id: step_id.to_string(),
                branches: branches.iter().map(|b| b.name.clone()).collect(),
            });
            return record_placeholder();
        }

        self.check_cancelled().await?;

        if let Some(existing) = self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?
        {
            let outcome: SwitchOutcome =
                serde_json::from_value(existing.result).map_err(|e| decode_error(step_id, e))?;
            debug!(step_id, branch = %outcome.branch, "switch replayed from memoized choice");
            return serde_json::from_value(outcome.result).map_err(|e| decode_error(step_id, e));
        }

        let choice = selector();
        let branch = branches
            .into_iter()
            .find(|b| b.name == choice)
            .or(default_branch);
        let Some(branch) = branch else {
            return Err(TaskError::msg(format!(
                "switch {step_id}: no branch matches {choice:?}"
            )));
        };

        let branch_name = branch.name;
        match (branch.run)().await {
            Ok(value) => {
                let result = serde_json::to_value(&value)
                    .map_err(|e| TaskError::Failed(ErrorInfo::new(format!(
                        "failed to encode result of step {step_id}: {e}"
                    ))))?;
                let outcome = SwitchOutcome {
                    branch: branch_name,
                    result,
                };
                self.store
                    .save_step_result(StepResult::new(
                        &self.execution_id,
                        step_id,
                        serde_json::to_value(&outcome)
                            .map_err(|e| TaskError::Failed(ErrorInfo::new(e.to_string())))?,
                    ))
                    .await?;
                self.audit_entry(AuditKind::StepCompleted, |e| e.with_step(step_id))
                    .await;
                Ok(value)
            }
            Err(err) => {
                let failure = ErrorInfo::from_anyhow(&err);
                self.audit_entry(AuditKind::StepFailed, |e| {
                    e.with_step(step_id).with_error(failure.clone())
                })
                .await;
                Err(TaskError::Failed(failure))
            }
        }
    }

    // =========================================================================
    // Sleeps
    // =========================================================================

    /// Durable sleep with an auto-derived step id (`sleep:<n>`)
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let ordinal = self.sleep_seq.fetch_add(1, Ordering::SeqCst);
        self.sleep_slot(&format!("sleep:{ordinal}"), duration).await
    }

    /// Durable sleep under an explicit step id
    pub async fn sleep_as(&self, step_id: &str, duration: Duration) -> Result<(), TaskError> {
        self.sleep_slot(step_id, duration).await
    }

    async fn sleep_slot(&self, step_id: &str, duration: Duration) -> Result<(), TaskError> {
        if self.recording() {
            self.record(FlowNode::Sleep {
                step_id: step_id.to_string(),
                duration_ms: duration.as_millis() as u64,
            });
            return Ok(());
        }

        self.check_cancelled().await?;

        match self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?
        {
            Some(existing) => match SlotState::decode(&existing.result) {
                Some(SlotState::Completed { .. }) | Some(SlotState::TimedOut) => Ok(()),
                Some(SlotState::Waiting { .. }) => Err(TaskError::Suspended),
                None => Err(TaskError::Failed(ErrorInfo::new(format!(
                    "step {step_id} is not a sleep slot"
                )))),
            },
            None => {
                let fire_at =
                    Utc::now() + chrono::Duration::milliseconds(duration.as_millis() as i64);
                let timer = Timer::sleep(&self.execution_id, step_id, fire_at);
                let timer_id = timer.id.clone();

                // Timer first: a crash between the two writes leaves a timer
                // whose firing re-writes the slot, never a slot without a
                // wake-up.
                self.store.create_timer(timer).await?;
                self.store
                    .save_step_result(StepResult::new(
                        &self.execution_id,
                        step_id,
                        SlotState::Waiting {
                            signal_id: None,
                            timer_id: Some(timer_id.clone()),
                        }
                        .encode(),
                    ))
                    .await?;

                self.audit_entry(AuditKind::SleepStarted, |e| {
                    e.with_step(step_id).with_timer(&timer_id)
                })
                .await;

                Err(TaskError::Suspended)
            }
        }
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Wait for the next delivered signal with the given id
    ///
    /// The k-th wait for a signal id uses the base slot for k = 0 and the
    /// `:k` overflow slot for k ≥ 1, so buffered deliveries are consumed in
    /// arrival order. A custom `step_id` pins the wait to a named slot
    /// tagged with the signal id.
    pub async fn wait_for_signal<T: DeserializeOwned>(
        &self,
        signal_id: &str,
        options: SignalWaitOptions,
    ) -> Result<T, TaskError> {
        if self.recording() {
            self.record(FlowNode::WaitSignal {
                signal_id: signal_id.to_string(),
                step_id: options.step_id.clone(),
                timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
            });
            return record_placeholder();
        }

        self.check_cancelled().await?;

        let slot_id = match &options.step_id {
            Some(custom) => format!("__signal:{custom}"),
            None => {
                let ordinal = {
                    let mut seq = self.signal_seq.lock();
                    let counter = seq.entry(signal_id.to_string()).or_insert(0);
                    let n = *counter;
                    *counter += 1;
                    n
                };
                if ordinal == 0 {
                    format!("__signal:{signal_id}")
                } else {
                    format!("__signal:{signal_id}:{ordinal}")
                }
            }
        };

        match self
            .store
            .get_step_result(&self.execution_id, &slot_id)
            .await?
        {
            Some(existing) => match SlotState::decode(&existing.result) {
                Some(SlotState::Completed { payload }) => {
                    serde_json::from_value(payload).map_err(|e| decode_error(&slot_id, e))
                }
                Some(SlotState::TimedOut) => Err(TaskError::SignalTimeout {
                    signal_id: signal_id.to_string(),
                }),
                Some(SlotState::Waiting { .. }) => Err(TaskError::Suspended),
                None => Err(TaskError::Failed(ErrorInfo::new(
                    "Invalid signal step state",
                ))),
            },
            None => {
                let timer_id = match options.timeout {
                    Some(timeout) => {
                        let fire_at = Utc::now()
                            + chrono::Duration::milliseconds(timeout.as_millis() as i64);
                        let timer = Timer::signal_timeout(&self.execution_id, &slot_id, fire_at);
                        let id = timer.id.clone();
                        self.store.create_timer(timer).await?;
                        Some(id)
                    }
                    None => None,
                };

                self.store
                    .save_step_result(StepResult::new(
                        &self.execution_id,
                        &slot_id,
                        SlotState::Waiting {
                            signal_id: Some(signal_id.to_string()),
                            timer_id: timer_id.clone(),
                        }
                        .encode(),
                    ))
                    .await?;

                self.audit_entry(AuditKind::SignalWaiting, |e| {
                    let e = e.with_signal(signal_id).with_step(&slot_id);
                    match &timer_id {
                        Some(t) => e.with_timer(t),
                        None => e,
                    }
                })
                .await;

                Err(TaskError::Suspended)
            }
        }
    }

    // =========================================================================
    // Events and notes
    // =========================================================================

    /// Publish a workflow-level event, memoized so replays do not re-publish
    pub async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), TaskError> {
        let ordinal = self.emit_seq.fetch_add(1, Ordering::SeqCst);
        self.emit_slot(&format!("emit:{ordinal}"), event, payload)
            .await
    }

    /// Publish an event under an explicit memoization step id
    pub async fn emit_as(
        &self,
        step_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TaskError> {
        self.emit_slot(step_id, event, payload).await
    }

    async fn emit_slot(
        &self,
        step_id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TaskError> {
        if self.recording() {
            self.record(FlowNode::Emit {
                event: event.to_string(),
                step_id: step_id.to_string(),
            });
            return Ok(());
        }

        if self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        if let Some(bus) = &self.bus {
            let channel = self.namespace.scoped(&format!("event:{event}"));
            let message = serde_json::json!({
                "event": event,
                "payload": payload,
                "timestamp": Utc::now(),
            });
            // Best-effort: the bus is advisory, the memo is authoritative
            if let Err(err) = bus.publish(&channel, message).await {
                warn!(%channel, error = %err, "failed to publish workflow event");
            }
        }

        self.store
            .save_step_result(StepResult::new(
                &self.execution_id,
                step_id,
                serde_json::json!({ "emitted": true, "event": event }),
            ))
            .await?;

        Ok(())
    }

    /// Append an audit note
    pub async fn note(&self, message: &str) {
        self.note_with(message, None).await;
    }

    /// Append an audit note with structured metadata
    pub async fn note_with(&self, message: &str, meta: Option<serde_json::Value>) {
        if self.recording() {
            self.record(FlowNode::Note {
                message: message.to_string(),
            });
            return;
        }

        let mut entry = AuditEntry::new(&self.execution_id, self.attempt, AuditKind::Note)
            .with_message(message);
        if let Some(meta) = meta {
            entry = entry.with_meta(meta);
        }
        self.audit.append(entry).await;
    }

    // =========================================================================
    // Compensation
    // =========================================================================

    /// Undo completed steps by running their compensations in reverse
    /// registration order
    ///
    /// The first failing compensation transitions the execution to
    /// `compensation_failed` and stops the chain; remaining compensations are
    /// not run.
    pub async fn rollback(&self) -> Result<(), TaskError> {
        if self.recording() {
            return Ok(());
        }

        let mut compensations: Vec<Compensation> = {
            let mut stack = self.compensations.lock();
            stack.drain(..).collect()
        };

        while let Some(compensation) = compensations.pop() {
            debug!(step_id = %compensation.step_id, "running compensation");
            if let Err(err) = (compensation.undo)().await {
                let failure = ErrorInfo::from_anyhow(&err);
                self.store
                    .update_execution(
                        &self.execution_id,
                        ExecutionPatch {
                            status: Some(ExecutionStatus::CompensationFailed),
                            error: Some(failure.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.audit_entry(AuditKind::CompensationFailed, |e| {
                    e.with_step(&compensation.step_id).with_error(failure.clone())
                })
                .await;
                return Err(TaskError::CompensationFailed {
                    step_id: compensation.step_id,
                    failure,
                });
            }
        }

        Ok(())
    }

    /// Run any registered compensations, logging failures instead of
    /// propagating them (used on cancellation)
    pub(crate) async fn run_compensations_best_effort(&self) {
        let mut compensations: Vec<Compensation> = {
            let mut stack = self.compensations.lock();
            stack.drain(..).collect()
        };

        while let Some(compensation) = compensations.pop() {
            if let Err(err) = (compensation.undo)().await {
                warn!(
                    step_id = %compensation.step_id,
                    error = %err,
                    "compensation failed during cancellation"
                );
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn check_cancelled(&self) -> Result<(), TaskError> {
        let execution = self.store.get_execution(&self.execution_id).await?;
        if let Some(execution) = execution {
            if execution.cancel_requested_at.is_some() {
                self.run_compensations_best_effort().await;
                return Err(TaskError::Cancelled);
            }
        }
        Ok(())
    }

    async fn audit_entry(&self, kind: AuditKind, build: impl FnOnce(AuditEntry) -> AuditEntry) {
        let entry = build(AuditEntry::new(&self.execution_id, self.attempt, kind));
        self.audit.append(entry).await;
    }

    fn recording(&self) -> bool {
        self.mode == ContextMode::Record
    }

    fn record(&self, node: FlowNode) {
        self.recorded.lock().push(node);
    }

    pub(crate) fn take_recorded(&self) -> Vec<FlowNode> {
        self.recorded.lock().drain(..).collect()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("execution_id", &self.execution_id)
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

fn decode_error(step_id: &str, err: serde_json::Error) -> TaskError {
    TaskError::Failed(ErrorInfo::new(format!(
        "failed to decode result of step {step_id}: {err}"
    )))
}

/// Recording mode yields a neutral placeholder the output type can decode
/// (null, zero, empty string/array/object, false). When none fits, the
/// recording ends at this node by unwinding as a suspension.
fn record_placeholder<T: DeserializeOwned>() -> Result<T, TaskError> {
    let candidates = [
        serde_json::Value::Null,
        serde_json::json!(0),
        serde_json::json!(""),
        serde_json::json!(false),
        serde_json::json!([]),
        serde_json::json!({}),
    ];
    candidates
        .into_iter()
        .find_map(|candidate| serde_json::from_value(candidate).ok())
        .ok_or(TaskError::Suspended)
}
