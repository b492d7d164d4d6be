//! Engine error taxonomy
//!
//! Errors are small sum types with `is_*` predicates rather than a class
//! hierarchy. [`TaskError::Suspended`] is pure control flow: it unwinds a
//! handler when the context parks on a sleep or signal wait, and the
//! execution manager converts it into the `sleeping` state. It is never
//! surfaced to external callers.

use crate::persistence::{ErrorInfo, StoreError};
use crate::queue::QueueError;
use crate::schedule::ScheduleError;

/// Error flowing through a task handler
///
/// Context primitives return this; `?` propagation keeps handlers linear.
/// User failures enter via [`anyhow::Error`] conversion.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The attempt parked on a pending sleep or signal wait. Control flow
    /// only; do not construct or catch this in handlers.
    #[error("execution suspended")]
    Suspended,

    /// Cancellation was requested and observed at a step boundary
    #[error("execution cancelled")]
    Cancelled,

    /// A signal wait expired
    #[error("timed out waiting for signal {signal_id}")]
    SignalTimeout { signal_id: String },

    /// Store failure while reading or writing durable state
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// User-level failure; subject to the retry policy
    #[error("{}", .0.message)]
    Failed(ErrorInfo),

    /// A compensation handler failed during rollback; the execution is stuck
    #[error("compensation for step {step_id} failed: {}", .failure.message)]
    CompensationFailed { step_id: String, failure: ErrorInfo },
}

impl TaskError {
    /// Shorthand for a user-level failure message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(ErrorInfo::new(message))
    }

    pub fn is_suspension(&self) -> bool {
        matches!(self, Self::Suspended)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_compensation_failure(&self) -> bool {
        matches!(self, Self::CompensationFailed { .. })
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(ErrorInfo::from_anyhow(&err))
    }
}

/// Terminal, client-observable failure of an execution
///
/// Returned by `wait`/`start_and_wait` when the execution failed, was
/// cancelled, or could not be found before the wait deadline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution {execution_id} of task {task_id} failed on attempt {attempt}: {}", .cause.message)]
pub struct DurableExecutionError {
    pub execution_id: String,
    pub task_id: String,
    pub attempt: u32,
    pub cause: ErrorInfo,
}

impl DurableExecutionError {
    /// Error for an execution the store no longer knows about
    pub fn unknown(execution_id: &str, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            task_id: "unknown".to_string(),
            attempt: 0,
            cause: ErrorInfo::new(message),
        }
    }
}

/// Facade-level error for all public engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration-level rejection (blank namespace, bad options, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown task id
    #[error("unknown task id: {0}")]
    UnknownTask(String),

    /// An advisory lock is held elsewhere; the caller may retry
    #[error("lock contention on {0}")]
    LockContention(String),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Queue failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Schedule validation or computation failure
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Execution finished unsuccessfully (from `wait`/`start_and_wait`)
    #[error(transparent)]
    Execution(#[from] DurableExecutionError),

    /// Internal consistency failure
    #[error("{0}")]
    Invariant(String),

    /// Payload encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContention(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownTask(_))
    }

    /// The underlying execution failure, when present
    pub fn as_execution_error(&self) -> Option<&DurableExecutionError> {
        match self {
            Self::Execution(err) => Some(err),
            _ => None,
        }
    }
}
