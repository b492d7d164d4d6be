//! Schedule management: one-off, cron, and interval triggers
//!
//! Recurring schedules persist a [`Schedule`] row and keep exactly one
//! pending `sched:<id>` timer armed while active. One-off schedules are just
//! a `once:<id>` timer carrying the task id and input.

mod cron;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::persistence::{
    Schedule, ScheduleKind, SchedulePatch, ScheduleStatus, Store, StoreError, Timer,
};

pub use self::cron::{next_cron_run, next_interval_run, parse_interval};

/// Error type for schedule validation and next-run computation
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Recurring scheduling needs a trigger definition
    #[error("schedule requires cron or interval")]
    MissingTrigger,

    /// An existing schedule id cannot move to a different task
    #[error("cannot rebind schedule {id} from task {existing_task} to {requested_task}")]
    CannotRebind {
        id: String,
        existing_task: String,
        requested_task: String,
    },

    /// Malformed cron expression
    #[error("invalid cron pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Malformed interval (must be a positive integer of milliseconds)
    #[error("invalid interval pattern {0:?}")]
    InvalidInterval(String),

    /// The cron expression never matches again
    #[error("no upcoming run for pattern {0:?}")]
    NoUpcomingRun(String),
}

/// When a scheduled execution should run
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// One-off, after a delay
    Delay(Duration),

    /// One-off, at an absolute instant
    At(DateTime<Utc>),

    /// Recurring on a 5-field cron expression
    Cron {
        id: Option<String>,
        pattern: String,
    },

    /// Recurring on a fixed interval
    Every {
        id: Option<String>,
        interval: Duration,
    },
}

/// Fields updatable on an existing schedule
#[derive(Debug, Clone, Default)]
pub struct ScheduleChange {
    pub cron: Option<String>,
    pub interval: Option<Duration>,
    pub input: Option<serde_json::Value>,
}

/// Creates, updates, and re-arms schedules
pub struct ScheduleManager {
    store: Arc<dyn Store>,
    lock_ttl: Duration,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn Store>, lock_ttl: Duration) -> Self {
        Self { store, lock_ttl }
    }

    /// Create a schedule or one-off timer for a task
    #[instrument(skip(self, input, spec))]
    pub async fn create(
        &self,
        task_id: &str,
        input: Option<serde_json::Value>,
        spec: ScheduleSpec,
    ) -> Result<String, EngineError> {
        let now = Utc::now();
        match spec {
            ScheduleSpec::Delay(delay) => {
                let fire_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                self.create_once(task_id, input, fire_at).await
            }
            ScheduleSpec::At(fire_at) => self.create_once(task_id, input, fire_at).await,
            ScheduleSpec::Cron { id, pattern } => {
                self.create_recurring(task_id, input, id, ScheduleKind::Cron, pattern, now)
                    .await
            }
            ScheduleSpec::Every { id, interval } => {
                let pattern = interval.as_millis().to_string();
                self.create_recurring(task_id, input, id, ScheduleKind::Interval, pattern, now)
                    .await
            }
        }
    }

    /// Idempotently ensure a recurring schedule exists with the given
    /// pattern and input
    ///
    /// Defaults the schedule id to the task id. Fails with a rebind error
    /// when the id already belongs to a different task, and with a
    /// missing-trigger error when called with a one-off spec.
    #[instrument(skip(self, input, spec))]
    pub async fn ensure(
        &self,
        task_id: &str,
        input: Option<serde_json::Value>,
        spec: ScheduleSpec,
    ) -> Result<String, EngineError> {
        let (id, kind, pattern) = match spec {
            ScheduleSpec::Cron { id, pattern } => (
                id.unwrap_or_else(|| task_id.to_string()),
                ScheduleKind::Cron,
                pattern,
            ),
            ScheduleSpec::Every { id, interval } => (
                id.unwrap_or_else(|| task_id.to_string()),
                ScheduleKind::Interval,
                interval.as_millis().to_string(),
            ),
            ScheduleSpec::Delay(_) | ScheduleSpec::At(_) => {
                return Err(ScheduleError::MissingTrigger.into());
            }
        };

        let resource = format!("schedule:{id}");
        let Some(lock_id) = self.store.acquire_lock(&resource, self.lock_ttl).await? else {
            return Err(EngineError::LockContention(resource));
        };

        let outcome = self
            .ensure_locked(&id, task_id, input, kind, pattern)
            .await;

        if let Err(err) = self.store.release_lock(&resource, &lock_id).await {
            tracing::warn!(%resource, error = %err, "failed to release schedule lock");
        }

        outcome
    }

    async fn ensure_locked(
        &self,
        id: &str,
        task_id: &str,
        input: Option<serde_json::Value>,
        kind: ScheduleKind,
        pattern: String,
    ) -> Result<String, EngineError> {
        let now = Utc::now();
        match self.store.get_schedule(id).await? {
            Some(existing) if existing.task_id != task_id => Err(ScheduleError::CannotRebind {
                id: id.to_string(),
                existing_task: existing.task_id,
                requested_task: task_id.to_string(),
            }
            .into()),
            Some(existing) => {
                let next = compute_next(kind, &pattern, now)?;
                let updated = self
                    .store
                    .update_schedule(
                        id,
                        SchedulePatch {
                            kind: Some(kind),
                            pattern: Some(pattern),
                            input,
                            next_run: Some(next),
                            ..Default::default()
                        },
                    )
                    .await?;

                if updated.status == ScheduleStatus::Active {
                    self.store
                        .create_timer(Timer::scheduled(id, task_id, updated.input.clone(), next))
                        .await?;
                } else {
                    self.store.delete_timer(&format!("sched:{id}")).await?;
                }

                debug!(schedule_id = id, status = ?existing.status, "ensured existing schedule");
                Ok(id.to_string())
            }
            None => {
                self.insert_schedule(id, task_id, input, kind, pattern, now)
                    .await
            }
        }
    }

    async fn create_once(
        &self,
        task_id: &str,
        input: Option<serde_json::Value>,
        fire_at: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let once_id = Uuid::now_v7().to_string();
        let timer = Timer::once(&once_id, task_id, input, fire_at);
        let timer_id = timer.id.clone();
        self.store.create_timer(timer).await?;
        debug!(%timer_id, task_id, %fire_at, "created one-off schedule timer");
        Ok(timer_id)
    }

    async fn create_recurring(
        &self,
        task_id: &str,
        input: Option<serde_json::Value>,
        id: Option<String>,
        kind: ScheduleKind,
        pattern: String,
        now: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let id = id.unwrap_or_else(|| Uuid::now_v7().to_string());
        self.insert_schedule(&id, task_id, input, kind, pattern, now)
            .await
    }

    async fn insert_schedule(
        &self,
        id: &str,
        task_id: &str,
        input: Option<serde_json::Value>,
        kind: ScheduleKind,
        pattern: String,
        now: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let next = compute_next(kind, &pattern, now)?;
        let schedule = Schedule {
            id: id.to_string(),
            task_id: task_id.to_string(),
            kind,
            pattern,
            input: input.clone(),
            status: ScheduleStatus::Active,
            last_run: None,
            next_run: Some(next),
            created_at: now,
            updated_at: now,
        };

        self.store.create_schedule(schedule).await?;
        self.store
            .create_timer(Timer::scheduled(id, task_id, input, next))
            .await?;

        debug!(schedule_id = id, task_id, %next, "created schedule");
        Ok(id.to_string())
    }

    /// Pause a schedule and drop its pending timer
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.store
            .update_schedule(
                id,
                SchedulePatch {
                    status: Some(ScheduleStatus::Paused),
                    ..Default::default()
                },
            )
            .await?;
        self.store.delete_timer(&format!("sched:{id}")).await?;
        Ok(())
    }

    /// Re-activate a paused schedule and arm its next timer
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        let schedule = self
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))?;

        if schedule.status == ScheduleStatus::Active {
            return Ok(());
        }

        let next = compute_next(schedule.kind, &schedule.pattern, Utc::now())?;
        self.store
            .update_schedule(
                id,
                SchedulePatch {
                    status: Some(ScheduleStatus::Active),
                    next_run: Some(next),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .create_timer(Timer::scheduled(
                id,
                &schedule.task_id,
                schedule.input.clone(),
                next,
            ))
            .await?;
        Ok(())
    }

    /// Patch an existing schedule's trigger and/or input
    pub async fn update(&self, id: &str, change: ScheduleChange) -> Result<(), EngineError> {
        let resource = format!("schedule:{id}");
        let Some(lock_id) = self.store.acquire_lock(&resource, self.lock_ttl).await? else {
            return Err(EngineError::LockContention(resource));
        };

        let outcome = self.update_locked(id, change).await;

        if let Err(err) = self.store.release_lock(&resource, &lock_id).await {
            tracing::warn!(%resource, error = %err, "failed to release schedule lock");
        }

        outcome
    }

    async fn update_locked(&self, id: &str, change: ScheduleChange) -> Result<(), EngineError> {
        let schedule = self
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))?;

        let (kind, pattern) = match (&change.cron, &change.interval) {
            (Some(cron), _) => (ScheduleKind::Cron, cron.clone()),
            (None, Some(interval)) => {
                (ScheduleKind::Interval, interval.as_millis().to_string())
            }
            (None, None) => (schedule.kind, schedule.pattern.clone()),
        };

        let next = compute_next(kind, &pattern, Utc::now())?;
        let updated = self
            .store
            .update_schedule(
                id,
                SchedulePatch {
                    kind: Some(kind),
                    pattern: Some(pattern),
                    input: change.input,
                    next_run: Some(next),
                    ..Default::default()
                },
            )
            .await?;

        if updated.status == ScheduleStatus::Active {
            self.store
                .create_timer(Timer::scheduled(
                    id,
                    &updated.task_id,
                    updated.input.clone(),
                    next,
                ))
                .await?;
        }
        Ok(())
    }

    /// Delete a schedule and its pending timer
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_timer(&format!("sched:{id}")).await?;
        self.store.delete_schedule(id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>, EngineError> {
        Ok(self.store.get_schedule(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, EngineError> {
        Ok(self.store.list_schedules().await?)
    }

    /// After a scheduled timer fires: record the run and arm the next timer
    ///
    /// Continuity invariant: for an active schedule another `sched:<id>`
    /// timer exists afterwards, firing at the computed next run.
    pub async fn rearm(&self, schedule: &Schedule, fired_at: DateTime<Utc>) -> Result<(), EngineError> {
        let next = compute_next(schedule.kind, &schedule.pattern, fired_at)?;
        self.store
            .update_schedule(
                &schedule.id,
                SchedulePatch {
                    last_run: Some(fired_at),
                    next_run: Some(next),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .create_timer(Timer::scheduled(
                &schedule.id,
                &schedule.task_id,
                schedule.input.clone(),
                next,
            ))
            .await?;
        debug!(schedule_id = %schedule.id, %next, "re-armed schedule");
        Ok(())
    }
}

/// Next fire time for a schedule kind and pattern
pub fn compute_next(
    kind: ScheduleKind,
    pattern: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    match kind {
        ScheduleKind::Cron => next_cron_run(pattern, now),
        ScheduleKind::Interval => next_interval_run(pattern, now),
    }
}
