//! Timer polling and dispatch
//!
//! One loop per worker scans ready timers, takes a short claim lease on
//! each, and dispatches by kind. Claim → dispatch → mark-fired → delete:
//! a timer row is only retired after its work succeeded, so a failed
//! dispatch is retried on a later cycle once the claim lease lapses.
//! Side effects behind a timer (slot writes, resumes) are idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::audit::AuditLogger;
use crate::engine::ExecutionRunner;
use crate::error::EngineError;
use crate::persistence::{
    AuditEntry, AuditKind, ScheduleStatus, SlotState, StepResult, Store, Timer, TimerKind,
};
use crate::schedule::ScheduleManager;

/// Polling configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between poll cycles
    pub interval: Duration,

    /// TTL of the per-timer claim lease
    pub claim_ttl: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }
}

/// Routes a fired timer to the component that owns its follow-up work
pub struct TimerDispatcher {
    store: Arc<dyn Store>,
    runner: Arc<ExecutionRunner>,
    schedules: Arc<ScheduleManager>,
    audit: AuditLogger,
}

impl TimerDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<ExecutionRunner>,
        schedules: Arc<ScheduleManager>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            store,
            runner,
            schedules,
            audit,
        }
    }

    /// Fire one claimed timer
    #[instrument(skip(self, timer), fields(timer_id = %timer.id, kind = ?timer.kind))]
    pub async fn handle_timer(&self, timer: &Timer) -> Result<(), EngineError> {
        match timer.kind {
            TimerKind::Sleep => self.fire_sleep(timer).await,
            TimerKind::SignalTimeout => self.fire_signal_timeout(timer).await,
            TimerKind::Scheduled => self.fire_scheduled(timer).await,
            TimerKind::Retry | TimerKind::Timeout | TimerKind::Kickoff => {
                self.fire_resume(timer).await
            }
        }
    }

    async fn fire_sleep(&self, timer: &Timer) -> Result<(), EngineError> {
        let (Some(execution_id), Some(step_id)) = (&timer.execution_id, &timer.step_id) else {
            self.finish_timer(&timer.id).await;
            return Ok(());
        };

        self.store
            .save_step_result(StepResult::new(
                execution_id,
                step_id,
                SlotState::Completed {
                    payload: Value::Null,
                }
                .encode(),
            ))
            .await?;

        let attempt = self.execution_attempt(execution_id).await;
        self.audit
            .append(
                AuditEntry::new(execution_id, attempt, AuditKind::SleepCompleted)
                    .with_step(step_id)
                    .with_timer(&timer.id),
            )
            .await;

        self.resume_if_live(execution_id).await?;
        self.finish_timer(&timer.id).await;
        Ok(())
    }

    async fn fire_signal_timeout(&self, timer: &Timer) -> Result<(), EngineError> {
        let (Some(execution_id), Some(step_id)) = (&timer.execution_id, &timer.step_id) else {
            self.finish_timer(&timer.id).await;
            return Ok(());
        };

        let slot = self.store.get_step_result(execution_id, step_id).await?;
        let waiting_signal = slot.as_ref().and_then(|s| match SlotState::decode(&s.result) {
            Some(SlotState::Waiting { signal_id, .. }) => Some(signal_id),
            _ => None,
        });

        if let Some(signal_id) = waiting_signal {
            self.store
                .save_step_result(StepResult::new(
                    execution_id,
                    step_id,
                    SlotState::TimedOut.encode(),
                ))
                .await?;

            let attempt = self.execution_attempt(execution_id).await;
            let mut entry = AuditEntry::new(execution_id, attempt, AuditKind::SignalTimedOut)
                .with_step(step_id)
                .with_timer(&timer.id);
            if let Some(signal_id) = signal_id {
                entry = entry.with_signal(signal_id);
            }
            self.audit.append(entry).await;

            self.resume_if_live(execution_id).await?;
        }

        self.finish_timer(&timer.id).await;
        Ok(())
    }

    async fn fire_scheduled(&self, timer: &Timer) -> Result<(), EngineError> {
        match &timer.schedule_id {
            Some(schedule_id) => {
                let Some(schedule) = self.store.get_schedule(schedule_id).await? else {
                    // Schedule removed with a timer still in flight
                    self.finish_timer(&timer.id).await;
                    return Ok(());
                };

                if schedule.status != ScheduleStatus::Active {
                    self.finish_timer(&timer.id).await;
                    return Ok(());
                }

                let fired_at = Utc::now();
                let execution_id = self
                    .runner
                    .launch(
                        &schedule.task_id,
                        schedule.input.clone().unwrap_or(Value::Null),
                        None,
                        None,
                    )
                    .await?;

                self.audit
                    .append(
                        AuditEntry::new(&execution_id, 1, AuditKind::ScheduleTriggered)
                            .with_meta(serde_json::json!({ "schedule_id": schedule_id })),
                    )
                    .await;

                // Retire the fired row before re-arming: both use sched:<id>
                self.finish_timer(&timer.id).await;
                self.schedules.rearm(&schedule, fired_at).await?;
                Ok(())
            }
            None => {
                // One-off timer carrying its own task and input
                let Some(task_id) = &timer.task_id else {
                    self.finish_timer(&timer.id).await;
                    return Ok(());
                };
                self.runner
                    .launch(task_id, timer.input.clone().unwrap_or(Value::Null), None, None)
                    .await?;
                self.finish_timer(&timer.id).await;
                Ok(())
            }
        }
    }

    async fn fire_resume(&self, timer: &Timer) -> Result<(), EngineError> {
        if let Some(execution_id) = &timer.execution_id {
            self.resume_if_live(execution_id).await?;
        }
        self.finish_timer(&timer.id).await;
        Ok(())
    }

    async fn resume_if_live(&self, execution_id: &str) -> Result<(), EngineError> {
        match self.store.get_execution(execution_id).await? {
            Some(execution) if !execution.is_terminal() => self.runner.resume(execution_id).await,
            _ => Ok(()),
        }
    }

    async fn execution_attempt(&self, execution_id: &str) -> u32 {
        match self.store.get_execution(execution_id).await {
            Ok(Some(execution)) => execution.attempt,
            _ => 0,
        }
    }

    /// Retire a dispatched timer (idempotent; errors only logged)
    async fn finish_timer(&self, timer_id: &str) {
        if let Err(err) = self.store.mark_timer_fired(timer_id).await {
            warn!(%timer_id, error = %err, "failed to mark timer fired");
            return;
        }
        if let Err(err) = self.store.delete_timer(timer_id).await {
            warn!(%timer_id, error = %err, "failed to delete fired timer");
        }
    }
}

struct PollerInner {
    store: Arc<dyn Store>,
    dispatcher: Arc<TimerDispatcher>,
    worker_id: String,
    config: PollerConfig,
}

impl PollerInner {
    async fn poll_once(&self) -> Result<(), EngineError> {
        let timers = self.store.ready_timers(Utc::now()).await?;
        if !timers.is_empty() {
            debug!(count = timers.len(), worker_id = %self.worker_id, "ready timers");
        }

        for timer in timers {
            match self
                .store
                .claim_timer(&timer.id, &self.worker_id, self.config.claim_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(timer_id = %timer.id, error = %err, "timer claim failed");
                    continue;
                }
            }

            if let Err(err) = self.dispatcher.handle_timer(&timer).await {
                warn!(timer_id = %timer.id, error = %err, "timer dispatch failed");
            }
        }

        Ok(())
    }
}

/// The per-worker polling loop
///
/// `start` is idempotent; `stop` flips the shutdown signal, cancels the next
/// tick, and joins the loop after the in-flight cycle completes.
pub struct TimerPoller {
    inner: Arc<PollerInner>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerPoller {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<TimerDispatcher>,
        worker_id: String,
        config: PollerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PollerInner {
                store,
                dispatcher,
                worker_id,
                config,
            }),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// Spawn the poll loop; repeated calls are no-ops while it runs
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let _ = self.shutdown_tx.send(false);
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            debug!(worker_id = %inner.worker_id, "timer poll loop started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                if let Err(err) = inner.poll_once().await {
                    warn!(error = %err, "timer poll cycle failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(inner.config.interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            debug!(worker_id = %inner.worker_id, "timer poll loop stopped");
        }));
    }

    /// Stop the loop, waiting for the in-flight cycle to complete
    pub async fn stop(&self) {
        let handle = { self.handle.lock().take() };
        let Some(handle) = handle else { return };

        let _ = self.shutdown_tx.send(true);
        if let Err(err) = handle.await {
            warn!(error = %err, "timer poll loop panicked");
        }
    }
}
