//! # Durable Workflow Engine
//!
//! A storage-backed engine that runs user-supplied async workflows
//! at-least-once to completion across process crashes, worker restarts,
//! retries, sleeps, and external signals, while each completed step runs
//! effectively at-most-once (its result is memoized).
//!
//! ## Features
//!
//! - **Step memoization**: every named step persists its result; replays
//!   short-circuit completed work
//! - **Durable sleeps and signals**: suspension points persist a timer or a
//!   signal slot and unwind the attempt; the polling loop resumes it later
//! - **Automatic retries**: exponential backoff with deterministic timer ids
//! - **Compensations**: `down` handlers undo completed steps in reverse
//!   order; a failed compensation parks the execution for an operator
//! - **Scheduling**: cron, interval, and one-off triggers
//! - **Pluggable backends**: store, queue, and event bus are narrow traits
//!   with in-memory and PostgreSQL reference implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableEngine                         │
//! │   (facade: start / wait / signal / schedule / recover)      │
//! └─────────────────────────────────────────────────────────────┘
//!                │                │                 │
//!                ▼                ▼                 ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │ ExecutionRunner  │ │  TimerPoller     │ │ SignalHandler    │
//! │ (attempt machine)│ │  (claim + fire)  │ │ (slot delivery)  │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!                │                │                 │
//!                ▼                ▼                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │   (executions, steps, timers, schedules, audit, locks)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mainstay_durable::prelude::*;
//!
//! struct Onboarding;
//!
//! #[async_trait]
//! impl Task for Onboarding {
//!     const ID: &'static str = "onboarding";
//!     type Input = SignupRequest;
//!     type Output = SignupReceipt;
//!
//!     async fn run(&self, ctx: &TaskContext, input: Self::Input) -> Result<Self::Output, TaskError> {
//!         let account = ctx.step("create-account", || create_account(&input)).await?;
//!         ctx.sleep(Duration::from_secs(3600)).await?;
//!         let paid: Payment = ctx.wait_for_signal("paid", Default::default()).await?;
//!         ctx.step("activate", || activate(&account, &paid)).await
//!     }
//! }
//!
//! let engine = DurableEngine::builder(Arc::new(MemoryStore::new()))
//!     .register(Onboarding)
//!     .build()?;
//! engine.start_polling();
//! ```

pub mod audit;
pub mod bus;
pub mod context;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod queue;
pub mod schedule;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{EventBus, MemoryBus};
    pub use crate::context::{Branch, FlowNode, SignalWaitOptions, TaskContext};
    pub use crate::engine::{DurableEngine, EngineConfig, StartOptions, WaitOptions};
    pub use crate::error::{DurableExecutionError, EngineError, TaskError};
    pub use crate::persistence::{
        Execution, ExecutionStatus, MemoryStore, PostgresStore, Store, StoreError,
    };
    pub use crate::queue::{MemoryQueue, Queue};
    pub use crate::schedule::{ScheduleChange, ScheduleSpec};
    pub use crate::task::Task;
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use audit::AuditLogger;
pub use bus::{BusError, BusSubscription, EventBus, MemoryBus};
pub use context::{Branch, FlowNode, SignalWaitOptions, TaskContext};
pub use engine::{
    AnyTask, DurableEngine, EngineConfig, ExecutionRunner, SignalHandler, StartOptions,
    TaskRegistry, WaitManager, WaitOptions,
};
pub use error::{DurableExecutionError, EngineError, TaskError};
pub use persistence::{
    AuditEntry, AuditKind, ErrorInfo, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus,
    InvalidNamespace, MemoryStore, Namespace, PostgresStore, Schedule, ScheduleKind,
    ScheduleStatus, SlotState, StepResult, Store, StoreError, Timer, TimerKind, TimerStatus,
};
pub use queue::{MemoryQueue, Queue, QueueDelivery, QueueError, QueueMessage};
pub use schedule::{ScheduleChange, ScheduleError, ScheduleManager, ScheduleSpec};
pub use task::Task;
pub use worker::{PollerConfig, TimerDispatcher, TimerPoller};
