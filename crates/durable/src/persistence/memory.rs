//! In-memory implementation of the Store for testing and inline mode

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Lease on a timer or lock; expiry is checked at read time
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-memory implementation of [`Store`]
///
/// Primarily for tests. It stores all data behind `RwLock`ed maps and
/// provides the same semantics as the PostgreSQL implementation, including
/// lease expiry for timer claims and advisory locks.
///
/// # Example
///
/// ```
/// use mainstay_durable::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    executions: RwLock<HashMap<String, Execution>>,
    steps: RwLock<HashMap<(String, String), StepResult>>,
    timers: RwLock<HashMap<String, Timer>>,
    timer_claims: RwLock<HashMap<String, Lease>>,
    schedules: RwLock<HashMap<String, Schedule>>,
    audit: RwLock<HashMap<String, Vec<AuditEntry>>>,
    locks: RwLock<HashMap<String, Lease>>,
    idempotency: RwLock<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            timer_claims: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            audit: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
        }
    }

    /// Number of executions (for tests)
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Number of pending timers (for tests)
    pub fn pending_timer_count(&self) -> usize {
        self.timers
            .read()
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .count()
    }

    /// Clear all data (for tests)
    pub fn clear(&self) {
        self.executions.write().clear();
        self.steps.write().clear();
        self.timers.write().clear();
        self.timer_claims.write().clear();
        self.schedules.write().clear();
        self.audit.write().clear();
        self.locks.write().clear();
        self.idempotency.write().clear();
    }

    fn apply_patch(execution: &mut Execution, patch: ExecutionPatch) {
        if let Some(status) = patch.status {
            execution.status = status;
        }
        if let Some(result) = patch.result {
            execution.result = Some(result);
        }
        if patch.clear_error {
            execution.error = None;
        } else if let Some(error) = patch.error {
            execution.error = Some(error);
        }
        if let Some(attempt) = patch.attempt {
            execution.attempt = attempt;
        }
        if let Some(completed_at) = patch.completed_at {
            execution.completed_at = Some(completed_at);
        }
        if let Some(cancelled_at) = patch.cancelled_at {
            execution.cancelled_at = Some(cancelled_at);
        }
        if let Some(cancel_requested_at) = patch.cancel_requested_at {
            execution.cancel_requested_at = Some(cancel_requested_at);
        }
        execution.updated_at = Utc::now();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_execution(&self, execution: Execution) -> Result<(), StoreError> {
        self.executions
            .write()
            .insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(id).cloned())
    }

    async fn update_execution(
        &self,
        id: &str,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;

        Self::apply_patch(execution, patch);
        Ok(execution.clone())
    }

    async fn list_incomplete(&self) -> Result<Vec<Execution>, StoreError> {
        let mut incomplete: Vec<_> = self
            .executions
            .read()
            .values()
            .filter(|e| {
                !e.status.is_terminal() && e.status != ExecutionStatus::CompensationFailed
            })
            .cloned()
            .collect();
        incomplete.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(incomplete)
    }

    async fn list_stuck(&self) -> Result<Vec<Execution>, StoreError> {
        let mut stuck: Vec<_> = self
            .executions
            .read()
            .values()
            .filter(|e| e.status == ExecutionStatus::CompensationFailed)
            .cloned()
            .collect();
        stuck.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(stuck)
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let mut matching: Vec<_> = self
            .executions
            .read()
            .values()
            .filter(|e| filter.statuses.is_empty() || filter.statuses.contains(&e.status))
            .filter(|e| {
                filter
                    .task_id
                    .as_ref()
                    .map(|t| &e.task_id == t)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<StepResult>, StoreError> {
        Ok(self
            .steps
            .read()
            .get(&(execution_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn save_step_result(&self, result: StepResult) -> Result<(), StoreError> {
        self.steps.write().insert(
            (result.execution_id.clone(), result.step_id.clone()),
            result,
        );
        Ok(())
    }

    async fn list_step_results(&self, execution_id: &str) -> Result<Vec<StepResult>, StoreError> {
        let mut results: Vec<_> = self
            .steps
            .read()
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then(a.step_id.cmp(&b.step_id))
        });
        Ok(results)
    }

    async fn create_timer(&self, timer: Timer) -> Result<(), StoreError> {
        let mut timers = self.timers.write();
        timers.insert(timer.id.clone(), timer);
        Ok(())
    }

    async fn ready_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>, StoreError> {
        let mut ready: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|t| t.status == TimerStatus::Pending && t.fire_at <= now)
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.id.cmp(&b.id)));
        Ok(ready)
    }

    async fn mark_timer_fired(&self, id: &str) -> Result<(), StoreError> {
        if let Some(timer) = self.timers.write().get_mut(id) {
            timer.status = TimerStatus::Fired;
        }
        Ok(())
    }

    async fn delete_timer(&self, id: &str) -> Result<(), StoreError> {
        self.timers.write().remove(id);
        self.timer_claims.write().remove(id);
        Ok(())
    }

    async fn claim_timer(
        &self,
        id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if !self.timers.read().contains_key(id) {
            return Ok(false);
        }

        let now = Utc::now();
        let mut claims = self.timer_claims.write();
        match claims.get(id) {
            Some(lease) if !lease.expired(now) && lease.holder != worker_id => Ok(false),
            _ => {
                claims.insert(
                    id.to_string(),
                    Lease {
                        holder: worker_id.to_string(),
                        expires_at: now
                            + chrono::Duration::milliseconds(ttl.as_millis() as i64),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn create_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        if schedules.contains_key(&schedule.id) {
            return Err(StoreError::AlreadyExists(schedule.id));
        }
        schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.read().get(id).cloned())
    }

    async fn update_schedule(
        &self,
        id: &str,
        patch: SchedulePatch,
    ) -> Result<Schedule, StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))?;

        if let Some(kind) = patch.kind {
            schedule.kind = kind;
        }
        if let Some(pattern) = patch.pattern {
            schedule.pattern = pattern;
        }
        if let Some(input) = patch.input {
            schedule.input = Some(input);
        }
        if let Some(status) = patch.status {
            schedule.status = status;
        }
        if let Some(last_run) = patch.last_run {
            schedule.last_run = Some(last_run);
        }
        if let Some(next_run) = patch.next_run {
            schedule.next_run = Some(next_run);
        }
        schedule.updated_at = Utc::now();
        Ok(schedule.clone())
    }

    async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        self.schedules.write().remove(id);
        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut all: Vec<_> = self.schedules.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn list_active_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut active: Vec<_> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn append_audit_entry(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.audit
            .write()
            .entry(entry.execution_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn list_audit_entries(
        &self,
        execution_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let audit = self.audit.read();
        let mut entries = audit.get(execution_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| a.at.cmp(&b.at).then(a.id.cmp(&b.id)));
        Ok(entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get(resource) {
            Some(lease) if !lease.expired(now) => Ok(None),
            _ => {
                let lock_id = Uuid::now_v7().to_string();
                locks.insert(
                    resource.to_string(),
                    Lease {
                        holder: lock_id.clone(),
                        expires_at: now
                            + chrono::Duration::milliseconds(ttl.as_millis() as i64),
                    },
                );
                Ok(Some(lock_id))
            }
        }
    }

    async fn release_lock(&self, resource: &str, lock_id: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.write();
        if locks.get(resource).map(|l| l.holder.as_str()) == Some(lock_id) {
            locks.remove(resource);
        }
        Ok(())
    }

    async fn get_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .idempotency
            .read()
            .get(&(task_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_execution_id_by_idempotency_key(
        &self,
        task_id: &str,
        key: &str,
        execution_id: &str,
    ) -> Result<String, StoreError> {
        let mut idempotency = self.idempotency.write();
        let winner = idempotency
            .entry((task_id.to_string(), key.to_string()))
            .or_insert_with(|| execution_id.to_string());
        Ok(winner.clone())
    }

    async fn retry_rollback(&self, execution_id: &str) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status != ExecutionStatus::CompensationFailed {
            return Err(StoreError::Database(format!(
                "execution {execution_id} is not compensation_failed"
            )));
        }

        execution.status = ExecutionStatus::Pending;
        execution.error = None;
        execution.updated_at = Utc::now();
        Ok(execution.clone())
    }

    async fn force_fail(
        &self,
        execution_id: &str,
        error: ErrorInfo,
    ) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;

        let now = Utc::now();
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(error);
        execution.completed_at = Some(now);
        execution.updated_at = now;
        Ok(execution.clone())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(id: &str) -> Execution {
        Execution::new(id, "task", serde_json::json!({}), 3, None)
    }

    #[tokio::test]
    async fn test_save_and_update_execution() {
        let store = MemoryStore::new();
        store.save_execution(execution("e1")).await.unwrap();

        let updated = store
            .update_execution(
                "e1",
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Running);

        let missing = store
            .update_execution("nope", ExecutionPatch::default())
            .await;
        assert!(matches!(missing, Err(StoreError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_error_on_patch() {
        let store = MemoryStore::new();
        store.save_execution(execution("e1")).await.unwrap();

        store
            .update_execution(
                "e1",
                ExecutionPatch {
                    error: Some(ErrorInfo::new("boom")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cleared = store
            .update_execution(
                "e1",
                ExecutionPatch {
                    clear_error: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.error.is_none());
    }

    #[tokio::test]
    async fn test_list_incomplete_excludes_stuck() {
        let store = MemoryStore::new();
        store.save_execution(execution("e1")).await.unwrap();

        let mut stuck = execution("e2");
        stuck.status = ExecutionStatus::CompensationFailed;
        store.save_execution(stuck).await.unwrap();

        let mut done = execution("e3");
        done.status = ExecutionStatus::Completed;
        store.save_execution(done).await.unwrap();

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "e1");

        let stuck = store.list_stuck().await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "e2");
    }

    #[tokio::test]
    async fn test_step_result_ordering() {
        let store = MemoryStore::new();

        let mut first = StepResult::new("e1", "b", serde_json::json!(1));
        first.completed_at = Utc::now() - chrono::Duration::seconds(10);
        store.save_step_result(first).await.unwrap();
        store
            .save_step_result(StepResult::new("e1", "a", serde_json::json!(2)))
            .await
            .unwrap();
        store
            .save_step_result(StepResult::new("other", "x", serde_json::json!(3)))
            .await
            .unwrap();

        let results = store.list_step_results("e1").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].step_id, "b");
        assert_eq!(results[1].step_id, "a");
    }

    #[tokio::test]
    async fn test_ready_timers_and_firing() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .create_timer(Timer::retry("e1", 1, now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        store
            .create_timer(Timer::retry("e2", 1, now + chrono::Duration::seconds(60)))
            .await
            .unwrap();

        let ready = store.ready_timers(now).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "retry:e1:1");

        store.mark_timer_fired("retry:e1:1").await.unwrap();
        assert!(store.ready_timers(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_timer_replaces_by_id() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .create_timer(Timer::scheduled("s1", "t", None, now))
            .await
            .unwrap();
        store
            .create_timer(Timer::scheduled(
                "s1",
                "t",
                None,
                now + chrono::Duration::seconds(60),
            ))
            .await
            .unwrap();

        assert_eq!(store.pending_timer_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_timer_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_timer(Timer::retry("e1", 1, now))
            .await
            .unwrap();

        assert!(store
            .claim_timer("retry:e1:1", "w1", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .claim_timer("retry:e1:1", "w2", Duration::from_secs(30))
            .await
            .unwrap());
        // Re-claim by the holder extends the lease
        assert!(store
            .claim_timer("retry:e1:1", "w1", Duration::from_secs(30))
            .await
            .unwrap());
        // Unknown timers cannot be claimed
        assert!(!store
            .claim_timer("retry:missing:1", "w1", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .create_timer(Timer::retry("e1", 1, now))
            .await
            .unwrap();

        assert!(store
            .claim_timer("retry:e1:1", "w1", Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .claim_timer("retry:e1:1", "w2", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_locks() {
        let store = MemoryStore::new();

        let lock_id = store
            .acquire_lock("execution:e1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("should acquire");
        assert!(store
            .acquire_lock("execution:e1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        // Release with the wrong id is a no-op
        store.release_lock("execution:e1", "bogus").await.unwrap();
        assert!(store
            .acquire_lock("execution:e1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        store.release_lock("execution:e1", &lock_id).await.unwrap();
        assert!(store
            .acquire_lock("execution:e1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_idempotency_set_if_absent() {
        let store = MemoryStore::new();

        let winner = store
            .set_execution_id_by_idempotency_key("t", "k", "e1")
            .await
            .unwrap();
        assert_eq!(winner, "e1");

        let loser = store
            .set_execution_id_by_idempotency_key("t", "k", "e2")
            .await
            .unwrap();
        assert_eq!(loser, "e1");

        assert_eq!(
            store
                .get_execution_id_by_idempotency_key("t", "k")
                .await
                .unwrap(),
            Some("e1".to_string())
        );
    }

    #[tokio::test]
    async fn test_operator_actions() {
        let store = MemoryStore::new();
        let mut stuck = execution("e1");
        stuck.status = ExecutionStatus::CompensationFailed;
        stuck.error = Some(ErrorInfo::new("down failed"));
        store.save_execution(stuck).await.unwrap();

        let reset = store.retry_rollback("e1").await.unwrap();
        assert_eq!(reset.status, ExecutionStatus::Pending);
        assert!(reset.error.is_none());

        // Only stuck executions can be reset
        assert!(store.retry_rollback("e1").await.is_err());

        let failed = store
            .force_fail("e1", ErrorInfo::new("operator gave up"))
            .await
            .unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert!(failed.completed_at.is_some());

        store.skip_step("e1", "cleanup").await.unwrap();
        let skipped = store.get_step_result("e1", "cleanup").await.unwrap().unwrap();
        assert_eq!(skipped.result, serde_json::Value::Null);

        store
            .edit_step_result("e1", "cleanup", serde_json::json!({"fixed": true}))
            .await
            .unwrap();
        let edited = store.get_step_result("e1", "cleanup").await.unwrap().unwrap();
        assert_eq!(edited.result, serde_json::json!({"fixed": true}));
    }

    #[tokio::test]
    async fn test_audit_ordering() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .append_audit_entry(AuditEntry::new("e1", 1, AuditKind::Note))
                .await
                .unwrap();
        }

        let entries = store.list_audit_entries("e1", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].at <= w[1].at));

        let page = store.list_audit_entries("e1", 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, entries[1].id);
    }
}
