//! Store trait definition and the persistent data model

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Timer not found
    #[error("timer not found: {0}")]
    TimerNotFound(String),

    /// A row with the same key already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet claimed by a worker
    Pending,

    /// A worker is currently driving an attempt
    Running,

    /// Last attempt failed; a retry timer is pending
    Retrying,

    /// Suspended on a sleep or signal wait
    Sleeping,

    /// Finished successfully
    Completed,

    /// Exhausted its attempts
    Failed,

    /// A compensation failed; requires operator intervention
    CompensationFailed,

    /// Cancelled by an external request
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again.
    ///
    /// `CompensationFailed` is deliberately non-terminal: an operator can
    /// reset it back to `Pending` via [`Store::retry_rollback`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::CompensationFailed => write!(f, "compensation_failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Captured failure details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Human-readable message
    pub message: String,

    /// Error chain / backtrace detail, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Capture an `anyhow` error including its source chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = err.to_string();
        let detail = format!("{err:?}");
        // The debug rendering repeats the message for chain-less errors.
        if detail == message {
            Self::new(message)
        } else {
            Self::new(message).with_detail(detail)
        }
    }
}

/// One run of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Current attempt number (1-based); bumped when a retry is scheduled
    pub attempt: u32,
    pub max_attempts: u32,

    /// Total wall-clock budget across all attempts, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<String>,
        input: serde_json::Value,
        max_attempts: u32,
        timeout_ms: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_id: task_id.into(),
            input,
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            timeout_ms,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
            cancel_requested_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the total wall-clock budget has been consumed.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.timeout_ms {
            Some(timeout_ms) => {
                let elapsed = now.signed_duration_since(self.created_at);
                elapsed.num_milliseconds() >= timeout_ms as i64
            }
            None => false,
        }
    }

    /// Remaining wall-clock budget, if a timeout is configured.
    pub fn remaining_budget(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.timeout_ms.map(|timeout_ms| {
            let elapsed = now.signed_duration_since(self.created_at).num_milliseconds();
            let remaining = (timeout_ms as i64).saturating_sub(elapsed.max(0));
            Duration::from_millis(remaining.max(0) as u64)
        })
    }
}

/// Partial update applied by [`Store::update_execution`]
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    /// Clear a previously recorded error (retry bookkeeping must not leak
    /// into a successful terminal state)
    pub clear_error: bool,
    pub attempt: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

/// Filter for listing executions
#[derive(Debug, Clone)]
pub struct ExecutionFilter {
    pub statuses: Vec<ExecutionStatus>,
    pub task_id: Option<String>,
    pub offset: u32,
    pub limit: u32,
}

impl Default for ExecutionFilter {
    fn default() -> Self {
        Self {
            statuses: vec![],
            task_id: None,
            offset: 0,
            limit: 100,
        }
    }
}

/// Memoized output of one named step inside an execution
///
/// Unique by (`execution_id`, `step_id`). Signal and sleep slots are stored
/// as step results too, with a [`SlotState`] value under the reserved
/// `__signal:` / sleep step-id namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: String,
    pub step_id: String,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn new(
        execution_id: impl Into<String>,
        step_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_id: step_id.into(),
            result,
            completed_at: Utc::now(),
        }
    }
}

/// State of a sleep or signal slot, persisted as the step-result value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// A waiter is parked on this slot
    Waiting {
        #[serde(skip_serializing_if = "Option::is_none")]
        signal_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timer_id: Option<String>,
    },

    /// The slot has been fulfilled
    Completed { payload: serde_json::Value },

    /// The wait expired before delivery
    TimedOut,
}

impl SlotState {
    pub fn decode(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }
}

/// Timer kinds dispatched by the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Sleep,
    Retry,
    Scheduled,
    SignalTimeout,
    Timeout,
    Kickoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Fired,
}

/// A persisted future wake-up event
///
/// Ids are deterministic where memoization matters, so re-creating a timer
/// for the same logical event cannot produce duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: String,
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl Timer {
    fn base(id: String, kind: TimerKind, fire_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            fire_at,
            status: TimerStatus::Pending,
            execution_id: None,
            step_id: None,
            schedule_id: None,
            task_id: None,
            input: None,
        }
    }

    pub fn sleep(execution_id: &str, step_id: &str, fire_at: DateTime<Utc>) -> Self {
        let mut timer = Self::base(
            format!("sleep:{execution_id}:{step_id}"),
            TimerKind::Sleep,
            fire_at,
        );
        timer.execution_id = Some(execution_id.to_string());
        timer.step_id = Some(step_id.to_string());
        timer
    }

    pub fn retry(execution_id: &str, attempt: u32, fire_at: DateTime<Utc>) -> Self {
        let mut timer = Self::base(
            format!("retry:{execution_id}:{attempt}"),
            TimerKind::Retry,
            fire_at,
        );
        timer.execution_id = Some(execution_id.to_string());
        timer
    }

    pub fn signal_timeout(execution_id: &str, step_id: &str, fire_at: DateTime<Utc>) -> Self {
        let mut timer = Self::base(
            format!("signal_timeout:{execution_id}:{step_id}"),
            TimerKind::SignalTimeout,
            fire_at,
        );
        timer.execution_id = Some(execution_id.to_string());
        timer.step_id = Some(step_id.to_string());
        timer
    }

    pub fn scheduled(
        schedule_id: &str,
        task_id: &str,
        input: Option<serde_json::Value>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        let mut timer = Self::base(format!("sched:{schedule_id}"), TimerKind::Scheduled, fire_at);
        timer.schedule_id = Some(schedule_id.to_string());
        timer.task_id = Some(task_id.to_string());
        timer.input = input;
        timer
    }

    pub fn once(
        once_id: &str,
        task_id: &str,
        input: Option<serde_json::Value>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        let mut timer = Self::base(format!("once:{once_id}"), TimerKind::Scheduled, fire_at);
        timer.task_id = Some(task_id.to_string());
        timer.input = input;
        timer
    }

    pub fn kickoff(execution_id: &str, fire_at: DateTime<Utc>) -> Self {
        let mut timer = Self::base(
            format!("kickoff:{execution_id}"),
            TimerKind::Kickoff,
            fire_at,
        );
        timer.execution_id = Some(execution_id.to_string());
        timer
    }
}

/// Recurring trigger kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

/// Recurring trigger definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub task_id: String,
    pub kind: ScheduleKind,

    /// Cron expression, or the interval in milliseconds as a decimal string
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`Store::update_schedule`]
#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub kind: Option<ScheduleKind>,
    pub pattern: Option<String>,
    pub input: Option<serde_json::Value>,
    pub status: Option<ScheduleStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Note,
    StepCompleted,
    StepFailed,
    SleepStarted,
    SleepCompleted,
    SignalWaiting,
    SignalDelivered,
    SignalTimedOut,
    RetryScheduled,
    ExecutionFailed,
    ExecutionCompleted,
    ExecutionCancelled,
    CompensationFailed,
    ScheduleTriggered,
}

/// Structured audit event, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp-prefixed so lexical order tracks creation order across nodes
    pub id: String,
    pub execution_id: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(execution_id: impl Into<String>, attempt: u32, kind: AuditKind) -> Self {
        let at = Utc::now();
        let suffix: u32 = rand::thread_rng().gen();
        Self {
            id: format!("{}:{suffix:08x}", at.timestamp_millis()),
            execution_id: execution_id.into(),
            attempt,
            at,
            kind,
            message: None,
            step_id: None,
            signal_id: None,
            timer_id: None,
            error: None,
            meta: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_signal(mut self, signal_id: impl Into<String>) -> Self {
        self.signal_id = Some(signal_id.into());
        self
    }

    pub fn with_timer(mut self, timer_id: impl Into<String>) -> Self {
        self.timer_id = Some(timer_id.into());
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Store for executions, step results, timers, schedules, audit entries, and
/// advisory locks
///
/// Implementations must be thread-safe and provide per-key linearizability.
/// All canonical state lives here; every other engine component holds only
/// transient in-memory handles.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Persist a new execution
    async fn save_execution(&self, execution: Execution) -> Result<(), StoreError>;

    /// Fetch an execution by id
    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError>;

    /// Apply a partial update, bumping `updated_at`
    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError>;

    /// Executions that still need a worker (pending/running/retrying/sleeping)
    async fn list_incomplete(&self) -> Result<Vec<Execution>, StoreError>;

    /// Executions stuck in `compensation_failed`
    async fn list_stuck(&self) -> Result<Vec<Execution>, StoreError>;

    /// List executions matching a filter, newest first
    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError>;

    // =========================================================================
    // Step results
    // =========================================================================

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<StepResult>, StoreError>;

    /// Insert or replace the result for (`execution_id`, `step_id`)
    async fn save_step_result(&self, result: StepResult) -> Result<(), StoreError>;

    /// All step results for an execution, ordered by `completed_at` then
    /// `step_id`
    async fn list_step_results(&self, execution_id: &str) -> Result<Vec<StepResult>, StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    /// Create a timer; replaces any previous timer with the same id so that
    /// at most one non-fired timer per deterministic id ever exists
    async fn create_timer(&self, timer: Timer) -> Result<(), StoreError>;

    /// Pending timers with `fire_at <= now`, ordered by `fire_at` then id
    async fn ready_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError>;

    /// Mark a timer fired (idempotent)
    async fn mark_timer_fired(&self, id: &str) -> Result<(), StoreError>;

    /// Delete a timer (no-op when absent)
    async fn delete_timer(&self, id: &str) -> Result<(), StoreError>;

    /// Take a short firing lease on a timer
    ///
    /// Returns `true` iff this caller now holds the lease; among concurrent
    /// claimers for the same id at most one wins until the TTL lapses.
    async fn claim_timer(
        &self,
        id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Schedules
    // =========================================================================

    async fn create_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError>;

    async fn update_schedule(
        &self,
        id: &str,
        patch: SchedulePatch,
    ) -> Result<Schedule, StoreError>;

    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    // =========================================================================
    // Audit log
    // =========================================================================

    async fn append_audit_entry(&self, entry: AuditEntry) -> Result<(), StoreError>;

    /// Entries for an execution ordered by `at` ascending, ties broken by id
    async fn list_audit_entries(
        &self,
        execution_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError>;

    // =========================================================================
    // Advisory locks
    // =========================================================================

    /// Acquire a leased lock on a resource; `None` when already held
    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// Release a lock if still held under `lock_id` (no-op otherwise)
    async fn release_lock(&self, resource: &str, lock_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    async fn get_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    /// SET-if-absent; returns the winning execution id (the caller's id when
    /// it won the race, the stored one otherwise)
    async fn set_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
        execution_id: &str,
    ) -> Result<String, StoreError>;

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Reset a `compensation_failed` execution back to `pending`, clearing
    /// its error so a worker retries the rollback
    async fn retry_rollback(&self, execution_id: &str) -> Result<Execution, StoreError>;

    /// Force an execution into the `failed` terminal state
    async fn force_fail(
        &self,
        execution_id: &str,
        error: ErrorInfo,
    ) -> Result<Execution, StoreError>;

    /// Record a null result for a step so replay passes over it
    async fn skip_step(&self, execution_id: &str, step_id: &str) -> Result<(), StoreError>;

    /// Overwrite a memoized step result
    async fn edit_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;
}
