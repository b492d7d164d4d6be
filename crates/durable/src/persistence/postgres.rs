//! PostgreSQL implementation of the Store
//!
//! Production persistence with:
//! - Single-statement conditional updates for timer claims and advisory locks
//! - Namespace column on every table for tenant isolation
//! - Whole-entry JSONB audit rows ordered by (`at`, id)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use super::Namespace;

/// PostgreSQL implementation of [`Store`]
///
/// Uses a connection pool; safe to clone and share across workers.
///
/// # Example
///
/// ```ignore
/// use mainstay_durable::{Namespace, PostgresStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mainstay").await?;
/// let store = PostgresStore::new(pool, Namespace::new("prod")?);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    namespace: Namespace,
}

impl PostgresStore {
    /// Create a store over an existing connection pool
    pub fn new(pool: PgPool, namespace: Namespace) -> Self {
        Self { pool, namespace }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn ns(&self) -> &str {
        self.namespace.as_str()
    }
}

fn db_err(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| {
        error!("{context}: {e}");
        StoreError::Database(e.to_string())
    }
}

fn parse_execution_status(status: &str) -> Result<ExecutionStatus, StoreError> {
    match status {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "retrying" => Ok(ExecutionStatus::Retrying),
        "sleeping" => Ok(ExecutionStatus::Sleeping),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "compensation_failed" => Ok(ExecutionStatus::CompensationFailed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Serialization(format!(
            "unknown execution status {other:?}"
        ))),
    }
}

fn parse_timer_kind(kind: &str) -> Result<TimerKind, StoreError> {
    match kind {
        "sleep" => Ok(TimerKind::Sleep),
        "retry" => Ok(TimerKind::Retry),
        "scheduled" => Ok(TimerKind::Scheduled),
        "signal_timeout" => Ok(TimerKind::SignalTimeout),
        "timeout" => Ok(TimerKind::Timeout),
        "kickoff" => Ok(TimerKind::Kickoff),
        other => Err(StoreError::Serialization(format!(
            "unknown timer kind {other:?}"
        ))),
    }
}

fn timer_kind_str(kind: TimerKind) -> &'static str {
    match kind {
        TimerKind::Sleep => "sleep",
        TimerKind::Retry => "retry",
        TimerKind::Scheduled => "scheduled",
        TimerKind::SignalTimeout => "signal_timeout",
        TimerKind::Timeout => "timeout",
        TimerKind::Kickoff => "kickoff",
    }
}

fn parse_schedule_kind(kind: &str) -> Result<ScheduleKind, StoreError> {
    match kind {
        "cron" => Ok(ScheduleKind::Cron),
        "interval" => Ok(ScheduleKind::Interval),
        other => Err(StoreError::Serialization(format!(
            "unknown schedule kind {other:?}"
        ))),
    }
}

fn parse_schedule_status(status: &str) -> Result<ScheduleStatus, StoreError> {
    match status {
        "active" => Ok(ScheduleStatus::Active),
        "paused" => Ok(ScheduleStatus::Paused),
        other => Err(StoreError::Serialization(format!(
            "unknown schedule status {other:?}"
        ))),
    }
}

fn schedule_status_str(status: ScheduleStatus) -> &'static str {
    match status {
        ScheduleStatus::Active => "active",
        ScheduleStatus::Paused => "paused",
    }
}

fn schedule_kind_str(kind: ScheduleKind) -> &'static str {
    match kind {
        ScheduleKind::Cron => "cron",
        ScheduleKind::Interval => "interval",
    }
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");
    let error = error_json
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Execution {
        id: row.get("id"),
        task_id: row.get("task_id"),
        input: row.get("input"),
        status: parse_execution_status(&status)?,
        result: row.get("result"),
        error,
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        timeout_ms: row.get::<Option<i64>, _>("timeout_ms").map(|t| t as u64),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.get("completed_at"),
        cancelled_at: row.get("cancelled_at"),
        cancel_requested_at: row.get("cancel_requested_at"),
    })
}

fn timer_from_row(row: &PgRow) -> Result<Timer, StoreError> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(Timer {
        id: row.get("id"),
        kind: parse_timer_kind(&kind)?,
        fire_at: row.get("fire_at"),
        status: match status.as_str() {
            "pending" => TimerStatus::Pending,
            "fired" => TimerStatus::Fired,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown timer status {other:?}"
                )))
            }
        },
        execution_id: row.get("execution_id"),
        step_id: row.get("step_id"),
        schedule_id: row.get("schedule_id"),
        task_id: row.get("task_id"),
        input: row.get("input"),
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(Schedule {
        id: row.get("id"),
        task_id: row.get("task_id"),
        kind: parse_schedule_kind(&kind)?,
        pattern: row.get("pattern"),
        input: row.get("input"),
        status: parse_schedule_status(&status)?,
        last_run: row.get("last_run"),
        next_run: row.get("next_run"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn save_execution(&self, execution: Execution) -> Result<(), StoreError> {
        let error_json = execution
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_executions (
                namespace, id, task_id, input, status, result, error,
                attempt, max_attempts, timeout_ms,
                created_at, updated_at, completed_at, cancelled_at, cancel_requested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (namespace, id) DO UPDATE SET
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                error = EXCLUDED.error,
                attempt = EXCLUDED.attempt,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(self.ns())
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(&execution.input)
        .bind(execution.status.to_string())
        .bind(&execution.result)
        .bind(&error_json)
        .bind(execution.attempt as i32)
        .bind(execution.max_attempts as i32)
        .bind(execution.timeout_ms.map(|t| t as i64))
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .bind(execution.cancelled_at)
        .bind(execution.cancel_requested_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to save execution"))?;

        debug!("saved execution");
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM durable_executions WHERE namespace = $1 AND id = $2
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to get execution"))?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self, patch))]
    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError> {
        let error_json = patch
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            UPDATE durable_executions SET
                status = COALESCE($3, status),
                result = COALESCE($4, result),
                error = CASE WHEN $5 THEN NULL ELSE COALESCE($6, error) END,
                attempt = COALESCE($7, attempt),
                completed_at = COALESCE($8, completed_at),
                cancelled_at = COALESCE($9, cancelled_at),
                cancel_requested_at = COALESCE($10, cancel_requested_at),
                updated_at = NOW()
            WHERE namespace = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .bind(patch.status.map(|s| s.to_string()))
        .bind(&patch.result)
        .bind(patch.clear_error)
        .bind(&error_json)
        .bind(patch.attempt.map(|a| a as i32))
        .bind(patch.completed_at)
        .bind(patch.cancelled_at)
        .bind(patch.cancel_requested_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to update execution"))?
        .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        execution_from_row(&row)
    }

    async fn list_incomplete(&self) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_executions
            WHERE namespace = $1
              AND status IN ('pending', 'running', 'retrying', 'sleeping')
            ORDER BY created_at, id
            "#,
        )
        .bind(self.ns())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list incomplete executions"))?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn list_stuck(&self) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_executions
            WHERE namespace = $1 AND status = 'compensation_failed'
            ORDER BY created_at, id
            "#,
        )
        .bind(self.ns())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list stuck executions"))?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let statuses: Option<Vec<String>> = if filter.statuses.is_empty() {
            None
        } else {
            Some(filter.statuses.iter().map(|s| s.to_string()).collect())
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_executions
            WHERE namespace = $1
              AND ($2::text[] IS NULL OR status = ANY($2))
              AND ($3::text IS NULL OR task_id = $3)
            ORDER BY created_at DESC, id
            OFFSET $4 LIMIT $5
            "#,
        )
        .bind(self.ns())
        .bind(&statuses)
        .bind(&filter.task_id)
        .bind(filter.offset as i64)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list executions"))?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<StepResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, step_id, result, completed_at
            FROM durable_step_results
            WHERE namespace = $1 AND execution_id = $2 AND step_id = $3
            "#,
        )
        .bind(self.ns())
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to get step result"))?;

        Ok(row.map(|row| StepResult {
            execution_id: row.get("execution_id"),
            step_id: row.get("step_id"),
            result: row.get("result"),
            completed_at: row.get("completed_at"),
        }))
    }

    #[instrument(skip(self, result), fields(execution_id = %result.execution_id, step_id = %result.step_id))]
    async fn save_step_result(&self, result: StepResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_step_results (namespace, execution_id, step_id, result, completed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace, execution_id, step_id) DO UPDATE SET
                result = EXCLUDED.result,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(self.ns())
        .bind(&result.execution_id)
        .bind(&result.step_id)
        .bind(&result.result)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to save step result"))?;

        debug!("saved step result");
        Ok(())
    }

    async fn list_step_results(&self, execution_id: &str) -> Result<Vec<StepResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_id, result, completed_at
            FROM durable_step_results
            WHERE namespace = $1 AND execution_id = $2
            ORDER BY completed_at, step_id
            "#,
        )
        .bind(self.ns())
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list step results"))?;

        Ok(rows
            .into_iter()
            .map(|row| StepResult {
                execution_id: row.get("execution_id"),
                step_id: row.get("step_id"),
                result: row.get("result"),
                completed_at: row.get("completed_at"),
            })
            .collect())
    }

    #[instrument(skip(self, timer), fields(timer_id = %timer.id))]
    async fn create_timer(&self, timer: Timer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_timers (
                namespace, id, kind, fire_at, status,
                execution_id, step_id, schedule_id, task_id, input
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9)
            ON CONFLICT (namespace, id) DO UPDATE SET
                kind = EXCLUDED.kind,
                fire_at = EXCLUDED.fire_at,
                status = 'pending',
                execution_id = EXCLUDED.execution_id,
                step_id = EXCLUDED.step_id,
                schedule_id = EXCLUDED.schedule_id,
                task_id = EXCLUDED.task_id,
                input = EXCLUDED.input,
                claimed_by = NULL,
                claim_expires_at = NULL
            "#,
        )
        .bind(self.ns())
        .bind(&timer.id)
        .bind(timer_kind_str(timer.kind))
        .bind(timer.fire_at)
        .bind(&timer.execution_id)
        .bind(&timer.step_id)
        .bind(&timer.schedule_id)
        .bind(&timer.task_id)
        .bind(&timer.input)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to create timer"))?;

        debug!("created timer");
        Ok(())
    }

    async fn ready_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_timers
            WHERE namespace = $1 AND status = 'pending' AND fire_at <= $2
            ORDER BY fire_at, id
            "#,
        )
        .bind(self.ns())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list ready timers"))?;

        rows.iter().map(timer_from_row).collect()
    }

    async fn mark_timer_fired(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE durable_timers SET status = 'fired'
            WHERE namespace = $1 AND id = $2
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to mark timer fired"))?;
        Ok(())
    }

    async fn delete_timer(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM durable_timers WHERE namespace = $1 AND id = $2
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to delete timer"))?;
        Ok(())
    }

    #[instrument(skip(self, ttl))]
    async fn claim_timer(
        &self,
        id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // Atomic lease-if-free-or-expired; the holder may renew
        let outcome = sqlx::query(
            r#"
            UPDATE durable_timers
            SET claimed_by = $3,
                claim_expires_at = NOW() + make_interval(secs => $4)
            WHERE namespace = $1 AND id = $2
              AND (claimed_by IS NULL OR claimed_by = $3 OR claim_expires_at <= NOW())
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .bind(worker_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to claim timer"))?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn create_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO durable_schedules (
                namespace, id, task_id, kind, pattern, input, status,
                last_run, next_run, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (namespace, id) DO NOTHING
            "#,
        )
        .bind(self.ns())
        .bind(&schedule.id)
        .bind(&schedule.task_id)
        .bind(schedule_kind_str(schedule.kind))
        .bind(&schedule.pattern)
        .bind(&schedule.input)
        .bind(schedule_status_str(schedule.status))
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to create schedule"))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(schedule.id));
        }
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM durable_schedules WHERE namespace = $1 AND id = $2
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to get schedule"))?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn update_schedule(
        &self,
        id: &str,
        patch: SchedulePatch,
    ) -> Result<Schedule, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_schedules SET
                kind = COALESCE($3, kind),
                pattern = COALESCE($4, pattern),
                input = COALESCE($5, input),
                status = COALESCE($6, status),
                last_run = COALESCE($7, last_run),
                next_run = COALESCE($8, next_run),
                updated_at = NOW()
            WHERE namespace = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .bind(patch.kind.map(schedule_kind_str))
        .bind(&patch.pattern)
        .bind(&patch.input)
        .bind(patch.status.map(schedule_status_str))
        .bind(patch.last_run)
        .bind(patch.next_run)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to update schedule"))?
        .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))?;

        schedule_from_row(&row)
    }

    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM durable_schedules WHERE namespace = $1 AND id = $2
            "#,
        )
        .bind(self.ns())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to delete schedule"))?;
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_schedules WHERE namespace = $1 ORDER BY id
            "#,
        )
        .bind(self.ns())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list schedules"))?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_schedules
            WHERE namespace = $1 AND status = 'active'
            ORDER BY id
            "#,
        )
        .bind(self.ns())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list active schedules"))?;

        rows.iter().map(schedule_from_row).collect()
    }

    async fn append_audit_entry(&self, entry: AuditEntry) -> Result<(), StoreError> {
        let entry_json =
            serde_json::to_value(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_audit_log (namespace, execution_id, id, attempt, at, entry)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (namespace, execution_id, id) DO NOTHING
            "#,
        )
        .bind(self.ns())
        .bind(&entry.execution_id)
        .bind(&entry.id)
        .bind(entry.attempt as i32)
        .bind(entry.at)
        .bind(&entry_json)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to append audit entry"))?;
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        execution_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entry FROM durable_audit_log
            WHERE namespace = $1 AND execution_id = $2
            ORDER BY at, id
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(self.ns())
        .bind(execution_id)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list audit entries"))?;

        rows.into_iter()
            .map(|row| {
                let entry: serde_json::Value = row.get("entry");
                serde_json::from_value(entry)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self, ttl))]
    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let lock_id = uuid::Uuid::now_v7().to_string();

        let row = sqlx::query(
            r#"
            INSERT INTO durable_locks (namespace, resource, lock_id, expires_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            ON CONFLICT (namespace, resource) DO UPDATE SET
                lock_id = EXCLUDED.lock_id,
                expires_at = EXCLUDED.expires_at
            WHERE durable_locks.expires_at <= NOW()
            RETURNING lock_id
            "#,
        )
        .bind(self.ns())
        .bind(resource)
        .bind(&lock_id)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to acquire lock"))?;

        Ok(row.map(|row| row.get("lock_id")))
    }

    async fn release_lock(&self, resource: &str, lock_id: &str) -> Result<(), StoreError> {
        // CAS by value: releasing with a stale id is a no-op
        sqlx::query(
            r#"
            DELETE FROM durable_locks
            WHERE namespace = $1 AND resource = $2 AND lock_id = $3
            "#,
        )
        .bind(self.ns())
        .bind(resource)
        .bind(lock_id)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to release lock"))?;
        Ok(())
    }

    async fn get_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id FROM durable_idempotency_keys
            WHERE namespace = $1 AND task_id = $2 AND idem_key = $3
            "#,
        )
        .bind(self.ns())
        .bind(task_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to get idempotency key"))?;

        Ok(row.map(|row| row.get("execution_id")))
    }

    async fn set_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
        execution_id: &str,
    ) -> Result<String, StoreError> {
        // SET-if-absent: the no-op update makes RETURNING yield the winner
        let row = sqlx::query(
            r#"
            INSERT INTO durable_idempotency_keys (namespace, task_id, idem_key, execution_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace, task_id, idem_key) DO UPDATE SET
                execution_id = durable_idempotency_keys.execution_id
            RETURNING execution_id
            "#,
        )
        .bind(self.ns())
        .bind(task_id)
        .bind(key)
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("failed to set idempotency key"))?;

        Ok(row.get("execution_id"))
    }

    #[instrument(skip(self))]
    async fn retry_rollback(&self, execution_id: &str) -> Result<Execution, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_executions
            SET status = 'pending', error = NULL, updated_at = NOW()
            WHERE namespace = $1 AND id = $2 AND status = 'compensation_failed'
            RETURNING *
            "#,
        )
        .bind(self.ns())
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to reset stuck execution"))?;

        match row {
            Some(row) => execution_from_row(&row),
            None => match self.get_execution(execution_id).await? {
                Some(_) => Err(StoreError::Database(format!(
                    "execution {execution_id} is not compensation_failed"
                ))),
                None => Err(StoreError::ExecutionNotFound(execution_id.to_string())),
            },
        }
    }

    #[instrument(skip(self, error))]
    async fn force_fail(
        &self,
        execution_id: &str,
        error: ErrorInfo,
    ) -> Result<Execution, StoreError> {
        let error_json =
            serde_json::to_value(&error).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            UPDATE durable_executions
            SET status = 'failed', error = $3, completed_at = NOW(), updated_at = NOW()
            WHERE namespace = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(self.ns())
        .bind(execution_id)
        .bind(&error_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to force-fail execution"))?
        .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

        execution_from_row(&row)
    }

    async fn skip_step(&self, execution_id: &str, step_id: &str) -> Result<(), StoreError> {
        self.save_step_result(StepResult::new(execution_id, step_id, serde_json::Value::Null))
            .await
    }

    async fn edit_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.save_step_result(StepResult::new(execution_id, step_id, value))
            .await
    }
}
