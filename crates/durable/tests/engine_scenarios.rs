//! End-to-end engine scenarios against the in-memory store
//!
//! Crash/restart is modelled as two engines ("service A" and "service B")
//! sharing one store: A is dropped mid-workflow and B picks the work up from
//! persisted state alone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use mainstay_durable::prelude::*;
use mainstay_durable::{ExecutionFilter, SlotState, StepResult, Timer, TimerStatus};

// ============================================
// Test tasks
// ============================================

#[derive(Clone)]
struct StepCounters {
    before: Arc<AtomicUsize>,
    after: Arc<AtomicUsize>,
}

impl StepCounters {
    fn new() -> Self {
        Self {
            before: Arc::new(AtomicUsize::new(0)),
            after: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// `before` step, durable sleep, `after` step
struct SleepyTask {
    counters: StepCounters,
}

#[async_trait]
impl Task for SleepyTask {
    const ID: &'static str = "sleepy";
    type Input = Value;
    type Output = Value;

    async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
        let before = self.counters.before.clone();
        let before_value: String = ctx
            .step("before", move || async move {
                before.fetch_add(1, Ordering::SeqCst);
                Ok("before".to_string())
            })
            .await?;

        ctx.sleep(Duration::from_millis(1)).await?;

        let after = self.counters.after.clone();
        let after_value: String = ctx
            .step("after", move || async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok("after".to_string())
            })
            .await?;

        Ok(json!({ "before": before_value, "after": after_value }))
    }
}

/// `before` step, one transient failure, `after` step on the retry
struct RetryTask {
    counters: StepCounters,
}

#[async_trait]
impl Task for RetryTask {
    const ID: &'static str = "retry-once";
    type Input = Value;
    type Output = Value;

    async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
        let before = self.counters.before.clone();
        let before_value: String = ctx
            .step("before", move || async move {
                before.fetch_add(1, Ordering::SeqCst);
                Ok("before".to_string())
            })
            .await?;

        if ctx.attempt() == 1 {
            return Err(TaskError::msg("first attempt goes down"));
        }

        let after = self.counters.after.clone();
        let after_value: String = ctx
            .step("after", move || async move {
                after.fetch_add(1, Ordering::SeqCst);
                Ok("after".to_string())
            })
            .await?;

        Ok(json!({ "before": before_value, "after": after_value }))
    }
}

/// Collects three `paid` signals and returns their payloads in order
struct CollectorTask;

#[async_trait]
impl Task for CollectorTask {
    const ID: &'static str = "collector";
    type Input = Value;
    type Output = Value;

    async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
        let mut collected = Vec::new();
        for _ in 0..3 {
            let payload: Value = ctx
                .wait_for_signal("paid", SignalWaitOptions::default())
                .await?;
            collected.push(payload);
        }
        Ok(Value::Array(collected))
    }
}

/// Always fails; used to drive the retry budget to exhaustion
struct DoomedTask;

#[async_trait]
impl Task for DoomedTask {
    const ID: &'static str = "doomed";
    type Input = Value;
    type Output = Value;

    async fn run(&self, _ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
        Err(TaskError::msg("doomed"))
    }
}

/// Reserves with a compensation, fails to charge, rolls back, gives up
struct SagaTask {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl Task for SagaTask {
    const ID: &'static str = "saga";
    type Input = Value;
    type Output = Value;

    async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
        let released = self.released.clone();
        let _: i64 = ctx
            .step_with_rollback(
                "reserve",
                || async { Ok(42) },
                move || async move {
                    released.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await?;

        let charge: Result<i64, TaskError> = ctx
            .step("charge", || async { Err(anyhow::anyhow!("card declined")) })
            .await;

        match charge {
            Ok(amount) => Ok(json!({ "charged": amount })),
            Err(err) => {
                ctx.rollback().await?;
                Err(err)
            }
        }
    }
}

struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    const ID: &'static str = "noop";
    type Input = Value;
    type Output = Value;

    async fn run(&self, _ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
        Ok(input)
    }
}

struct OtherTask;

#[async_trait]
impl Task for OtherTask {
    const ID: &'static str = "other";
    type Input = Value;
    type Output = Value;

    async fn run(&self, _ctx: &TaskContext, input: Value) -> Result<Value, TaskError> {
        Ok(input)
    }
}

fn engine_on(store: Arc<MemoryStore>, counters: &StepCounters) -> DurableEngine {
    DurableEngine::builder(store)
        .register(SleepyTask {
            counters: counters.clone(),
        })
        .register(RetryTask {
            counters: counters.clone(),
        })
        .register(CollectorTask)
        .register(DoomedTask)
        .register(NoopTask)
        .register(OtherTask)
        .build()
        .expect("engine should build")
}

async fn ready_timers(store: &MemoryStore) -> Vec<Timer> {
    store
        .ready_timers(Utc::now() + chrono::Duration::days(1))
        .await
        .expect("should list timers")
}

// ============================================
// Crash-resume through sleep
// ============================================

#[test_log::test(tokio::test)]
async fn crash_resume_through_sleep() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();

    // Service A runs until the sleep suspends the attempt
    let service_a = engine_on(store.clone(), &counters);
    let execution_id = service_a
        .start("sleepy", Value::Null, StartOptions::default())
        .await
        .expect("should start");

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Sleeping);
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);
    assert_eq!(counters.after.load(Ordering::SeqCst), 0);

    // Service A crashes; service B shares only the store
    drop(service_a);
    let service_b = engine_on(store.clone(), &counters);

    let timers = ready_timers(&store).await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].id, format!("sleep:{execution_id}:sleep:0"));

    service_b
        .handle_timer(&timers[0])
        .await
        .expect("timer should fire");

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.result,
        Some(json!({ "before": "before", "after": "after" }))
    );
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);
    assert_eq!(counters.after.load(Ordering::SeqCst), 1);
}

// ============================================
// Retry with step memoization
// ============================================

#[test_log::test(tokio::test)]
async fn retry_replays_memoized_steps() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let execution_id = engine
        .start(
            "retry-once",
            Value::Null,
            StartOptions {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .expect("should start");

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Retrying);
    assert_eq!(execution.attempt, 2);
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);

    // Retry budget invariant: a pending retry timer exists for the attempt
    let timers = ready_timers(&store).await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].id, format!("retry:{execution_id}:1"));

    engine
        .handle_timer(&timers[0])
        .await
        .expect("retry should fire");

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.result,
        Some(json!({ "before": "before", "after": "after" }))
    );
    // `before` replayed from the memo; `after` ran exactly once
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);
    assert_eq!(counters.after.load(Ordering::SeqCst), 1);
}

// ============================================
// Signal delivery with overflow
// ============================================

#[test_log::test(tokio::test)]
async fn signal_overflow_buffering() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    // Terminal execution with an already-consumed base slot
    let mut execution = Execution::new("e1", "noop", Value::Null, 1, None);
    execution.status = ExecutionStatus::Completed;
    store.save_execution(execution).await.unwrap();
    store
        .save_step_result(StepResult::new(
            "e1",
            "__signal:paid",
            SlotState::Completed {
                payload: json!({"n": 1}),
            }
            .encode(),
        ))
        .await
        .unwrap();

    engine.signal("e1", "paid", json!({"n": 2})).await.unwrap();
    engine.signal("e1", "paid", json!({"n": 3})).await.unwrap();

    for (slot_id, expected) in [
        ("__signal:paid", json!({"n": 1})),
        ("__signal:paid:1", json!({"n": 2})),
        ("__signal:paid:2", json!({"n": 3})),
    ] {
        let slot = store.get_step_result("e1", slot_id).await.unwrap().unwrap();
        assert_eq!(
            SlotState::decode(&slot.result),
            Some(SlotState::Completed { payload: expected }),
            "slot {slot_id}"
        );
    }
}

// ============================================
// Base slot preferred over custom slot
// ============================================

#[test_log::test(tokio::test)]
async fn base_slot_preferred_over_custom() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let mut execution = Execution::new("e1", "noop", Value::Null, 1, None);
    execution.status = ExecutionStatus::Completed;
    store.save_execution(execution).await.unwrap();

    store
        .save_step_result(StepResult::new(
            "e1",
            "__signal:paid",
            SlotState::Waiting {
                signal_id: None,
                timer_id: None,
            }
            .encode(),
        ))
        .await
        .unwrap();
    store
        .save_step_result(StepResult::new(
            "e1",
            "__signal:stable-paid",
            SlotState::Waiting {
                signal_id: Some("paid".to_string()),
                timer_id: None,
            }
            .encode(),
        ))
        .await
        .unwrap();

    engine.signal("e1", "paid", json!({"n": 1})).await.unwrap();

    let base = store
        .get_step_result("e1", "__signal:paid")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        SlotState::decode(&base.result),
        Some(SlotState::Completed {
            payload: json!({"n": 1})
        })
    );

    let custom = store
        .get_step_result("e1", "__signal:stable-paid")
        .await
        .unwrap()
        .unwrap();
    assert!(SlotState::decode(&custom.result).unwrap().is_waiting());
}

// ============================================
// Delivery cancels the timeout timer and resumes
// ============================================

#[test_log::test(tokio::test)]
async fn signal_delivery_cancels_timeout_timer() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let engine = DurableEngine::builder(store.clone())
        .register(NoopTask)
        .queue(queue.clone())
        .build()
        .unwrap();

    let mut execution = Execution::new("e1", "noop", Value::Null, 1, None);
    execution.status = ExecutionStatus::Sleeping;
    store.save_execution(execution).await.unwrap();

    let timer = Timer::signal_timeout("e1", "__signal:paid:1", Utc::now());
    store.create_timer(timer.clone()).await.unwrap();
    store
        .save_step_result(StepResult::new(
            "e1",
            "__signal:paid:1",
            SlotState::Waiting {
                signal_id: None,
                timer_id: Some(timer.id.clone()),
            }
            .encode(),
        ))
        .await
        .unwrap();

    engine.signal("e1", "paid", json!({"n": 9})).await.unwrap();

    let slot = store
        .get_step_result("e1", "__signal:paid:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        SlotState::decode(&slot.result),
        Some(SlotState::Completed {
            payload: json!({"n": 9})
        })
    );
    assert_eq!(store.pending_timer_count(), 0);

    let delivery = queue.receive().await.unwrap().expect("resume enqueued");
    assert_eq!(delivery.message().execution_id(), "e1");
}

// ============================================
// Schedule rebind rejected
// ============================================

#[test_log::test(tokio::test)]
async fn schedule_rebind_rejected() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    engine
        .ensure_schedule(
            "noop",
            None,
            ScheduleSpec::Every {
                id: Some("s1".to_string()),
                interval: Duration::from_millis(1000),
            },
        )
        .await
        .expect("first ensure should succeed");

    let rebound = engine
        .ensure_schedule(
            "other",
            None,
            ScheduleSpec::Every {
                id: Some("s1".to_string()),
                interval: Duration::from_millis(1000),
            },
        )
        .await
        .expect_err("rebind must be rejected");
    assert!(rebound.to_string().contains("cannot rebind"));
}

// ============================================
// Invariants
// ============================================

#[test_log::test(tokio::test)]
async fn signal_ordering_waiters_receive_arrival_order() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let execution_id = engine
        .start("collector", Value::Null, StartOptions::default())
        .await
        .unwrap();
    assert_eq!(
        store
            .get_execution(&execution_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        ExecutionStatus::Sleeping
    );

    // Each delivery resumes the collector, which parks on the next slot
    engine.signal(&execution_id, "paid", json!(1)).await.unwrap();
    engine.signal(&execution_id, "paid", json!(2)).await.unwrap();
    engine.signal(&execution_id, "paid", json!(3)).await.unwrap();

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!([1, 2, 3])));
}

#[test_log::test(tokio::test)]
async fn retry_budget_exhausts_at_max_attempts() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let execution_id = engine
        .start(
            "doomed",
            Value::Null,
            StartOptions {
                max_attempts: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for expected_attempt in 2..=3 {
        let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Retrying);
        assert_eq!(execution.attempt, expected_attempt);

        let timers = ready_timers(&store).await;
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers[0].id,
            format!("retry:{execution_id}:{}", expected_attempt - 1)
        );
        engine.handle_timer(&timers[0]).await.unwrap();
    }

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempt, 3);
    assert!(ready_timers(&store).await.is_empty());
}

#[test_log::test(tokio::test)]
async fn schedule_continuity_after_fire() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    engine
        .ensure_schedule(
            "noop",
            Some(json!({"tick": true})),
            ScheduleSpec::Every {
                id: Some("s1".to_string()),
                interval: Duration::from_secs(60),
            },
        )
        .await
        .unwrap();

    let timers = ready_timers(&store).await;
    assert_eq!(timers.len(), 1);
    engine.handle_timer(&timers[0]).await.unwrap();

    // A fresh sched timer exists at exactly the schedule's next run
    let schedule = engine.get_schedule("s1").await.unwrap().unwrap();
    let timers = ready_timers(&store).await;
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].id, "sched:s1");
    assert_eq!(timers[0].status, TimerStatus::Pending);
    assert_eq!(Some(timers[0].fire_at), schedule.next_run);

    // The fired schedule produced exactly one completed execution
    let executions = engine
        .list_executions(ExecutionFilter::default())
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
    assert_eq!(executions[0].result, Some(json!({"tick": true})));
}

#[test_log::test(tokio::test)]
async fn at_most_one_terminal_transition() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let execution_id = engine
        .start("noop", json!("done"), StartOptions::default())
        .await
        .unwrap();
    let completed = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(completed.status, ExecutionStatus::Completed);
    let completed_at = completed.completed_at;

    // Cancelling a terminal execution is a no-op
    engine
        .cancel_execution(&execution_id, Some("too late".to_string()))
        .await
        .unwrap();

    let unchanged = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, ExecutionStatus::Completed);
    assert_eq!(unchanged.completed_at, completed_at);
    assert!(unchanged.cancel_requested_at.is_none());
}

#[test_log::test(tokio::test)]
async fn recover_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = engine_on(store.clone(), &counters);

    let sleeping = engine
        .start("sleepy", Value::Null, StartOptions::default())
        .await
        .unwrap();
    let completed = engine
        .start("noop", Value::Null, StartOptions::default())
        .await
        .unwrap();

    let first = engine.recover().await.unwrap();
    let second = engine.recover().await.unwrap();
    assert_eq!(first, second);

    assert_eq!(
        store.get_execution(&sleeping).await.unwrap().unwrap().status,
        ExecutionStatus::Sleeping
    );
    assert_eq!(
        store.get_execution(&completed).await.unwrap().unwrap().status,
        ExecutionStatus::Completed
    );
    // The before step never re-ran during recovery
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn rollback_releases_reservation_then_fails() {
    let store = Arc::new(MemoryStore::new());
    let released = Arc::new(AtomicUsize::new(0));
    let engine = DurableEngine::builder(store.clone())
        .register(SagaTask {
            released: released.clone(),
        })
        .build()
        .unwrap();

    let execution_id = engine
        .start("saga", Value::Null, StartOptions::default())
        .await
        .unwrap();

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().message, "card declined");
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

// ============================================
// Full loop: queue + bus + polling
// ============================================

#[test_log::test(tokio::test)]
async fn background_workers_drive_sleepy_task_to_completion() {
    let store = Arc::new(MemoryStore::new());
    let counters = StepCounters::new();
    let engine = DurableEngine::builder(store.clone())
        .register(SleepyTask {
            counters: counters.clone(),
        })
        .queue(Arc::new(MemoryQueue::new()))
        .bus(Arc::new(MemoryBus::new()))
        .config(EngineConfig::new().with_poll_interval(Duration::from_millis(20)))
        .build()
        .unwrap();

    engine.start_polling();
    // start_polling is idempotent
    engine.start_polling();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        engine.start_and_wait(
            "sleepy",
            Value::Null,
            StartOptions {
                wait_poll_interval: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        ),
    )
    .await
    .expect("workflow should finish in time")
    .expect("workflow should succeed");

    assert_eq!(result, json!({ "before": "before", "after": "after" }));
    assert_eq!(counters.before.load(Ordering::SeqCst), 1);
    assert_eq!(counters.after.load(Ordering::SeqCst), 1);

    engine.stop().await;
}

// ============================================
// Operator flow: stuck execution recovery
// ============================================

#[test_log::test(tokio::test)]
async fn operator_resets_stuck_execution() {
    let store = Arc::new(MemoryStore::new());
    let released = Arc::new(AtomicUsize::new(0));

    // A saga whose compensation fails on its first invocation only
    struct FlakyRollback {
        released: Arc<AtomicUsize>,
        undo_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for FlakyRollback {
        const ID: &'static str = "flaky-rollback";
        type Input = Value;
        type Output = Value;

        async fn run(&self, ctx: &TaskContext, _input: Value) -> Result<Value, TaskError> {
            let released = self.released.clone();
            let undo_calls = self.undo_calls.clone();
            let _: i64 = ctx
                .step_with_rollback(
                    "reserve",
                    || async { Ok(1) },
                    move || async move {
                        if undo_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("lease service unavailable");
                        }
                        released.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .await?;
            ctx.rollback().await?;
            Err(TaskError::msg("gave up after rollback"))
        }
    }

    let engine = DurableEngine::builder(store.clone())
        .register(FlakyRollback {
            released: released.clone(),
            undo_calls: Arc::new(AtomicUsize::new(0)),
        })
        .build()
        .unwrap();

    let execution_id = engine
        .start("flaky-rollback", Value::Null, StartOptions::default())
        .await
        .unwrap();

    let stuck = engine.list_stuck().await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, execution_id);
    assert_eq!(stuck[0].status, ExecutionStatus::CompensationFailed);

    // Operator action: reset and re-run the rollback
    engine.retry_rollback(&execution_id).await.unwrap();

    let execution = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(engine.list_stuck().await.unwrap().is_empty());
}
