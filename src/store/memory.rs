use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use super::{LockStore, StateStore, StoreError};
use crate::models::{
    ExecutionLogRecord, ParseResultRecord, RecoveryEntry, SessionRecord, TargetRecord,
    TargetStatus, TaskRecord, TaskStatus,
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionRecord>,
    tasks: HashMap<String, TaskRecord>,
    targets: HashMap<String, TargetRecord>,
    parse_results: Vec<ParseResultRecord>,
    logs: Vec<ExecutionLogRecord>,
}

/// in-memory state store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self, owner_user_id: i64) -> Result<Vec<SessionRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut sessions: Vec<SessionRecord> = state
            .sessions
            .values()
            .filter(|record| record.owner_user_id == owner_user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .sessions
            .get_mut(&record.session_id)
            .ok_or(StoreError::NotFound)?;
        if stored.version != record.version {
            return Err(StoreError::Conflict);
        }
        let mut updated = record.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn create_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.tasks.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn update_task(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .tasks
            .get_mut(&record.task_id)
            .ok_or(StoreError::NotFound)?;
        if stored.version != record.version {
            return Err(StoreError::Conflict);
        }
        let mut updated = record.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn next_pending_task(&self) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut pending: Vec<&TaskRecord> = state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.task_id.cmp(&b.task_id))
        });
        Ok(pending.first().map(|task| (*task).clone()))
    }

    async fn due_resumable_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Paused
                    && task.resume_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_targets(&self, targets: &[TargetRecord]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for target in targets {
            state
                .targets
                .insert(target.target_id.clone(), target.clone());
        }
        Ok(())
    }

    async fn get_target(&self, target_id: &str) -> Result<Option<TargetRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.targets.get(target_id).cloned())
    }

    async fn update_target(&self, record: &TargetRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.targets.contains_key(&record.target_id) {
            return Err(StoreError::NotFound);
        }
        state
            .targets
            .insert(record.target_id.clone(), record.clone());
        Ok(())
    }

    async fn next_pending_target(
        &self,
        task_id: &str,
    ) -> Result<Option<TargetRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        let next = state
            .targets
            .values()
            .filter(|target| target.task_id == task_id && target.status == TargetStatus::Pending)
            .min_by(|a, b| {
                a.position
                    .cmp(&b.position)
                    .then(a.target_id.cmp(&b.target_id))
            });
        Ok(next.cloned())
    }

    async fn requeue_target_front(&self, target_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let task_id = state
            .targets
            .get(target_id)
            .map(|target| target.task_id.clone())
            .ok_or(StoreError::NotFound)?;
        let head = state
            .targets
            .values()
            .filter(|target| target.task_id == task_id && target.status == TargetStatus::Pending)
            .map(|target| target.position)
            .min()
            .unwrap_or(0);
        let target = state.targets.get_mut(target_id).unwrap();
        target.status = TargetStatus::Pending;
        target.position = head - 1;
        Ok(())
    }

    async fn count_targets(
        &self,
        task_id: &str,
        status: TargetStatus,
    ) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .targets
            .values()
            .filter(|target| target.task_id == task_id && target.status == status)
            .count() as u64)
    }

    async fn insert_parse_results(
        &self,
        results: &[ParseResultRecord],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.parse_results.extend_from_slice(results);
        Ok(())
    }

    async fn count_parse_results(&self, task_id: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .parse_results
            .iter()
            .filter(|result| result.task_id == task_id)
            .count() as u64)
    }

    async fn parse_results_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<ParseResultRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .parse_results
            .iter()
            .filter(|result| result.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &ExecutionLogRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.logs.push(entry.clone());
        Ok(())
    }

    async fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLogRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect())
    }
}

struct LockEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// in-memory lock store; the compare-and-swap happens under one mutex, so
/// two racing callers see first-writer-wins exactly like the durable variant
#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<String, LockEntry>>,
    recovery: Mutex<BTreeMap<(DateTime<Utc>, String), RecoveryEntry>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(account_id) {
            if entry.expires_at > now && entry.holder != holder {
                return Ok(false);
            }
        }
        locks.insert(
            account_id.to_string(),
            LockEntry {
                holder: holder.to_string(),
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            },
        );
        Ok(true)
    }

    async fn extend(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(account_id) {
            Some(entry) if entry.holder == holder && entry.expires_at > now => {
                entry.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, account_id: &str, holder: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(account_id) {
            if entry.holder == holder {
                locks.remove(account_id);
            }
        }
        Ok(())
    }

    async fn holder(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let locks = self.locks.lock().unwrap();
        Ok(locks
            .get(account_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder.clone()))
    }

    async fn schedule_recovery(&self, entry: &RecoveryEntry) -> Result<(), StoreError> {
        let mut recovery = self.recovery.lock().unwrap();
        recovery.retain(|_, existing| existing.account_id != entry.account_id);
        recovery.insert((entry.due_at, entry.account_id.clone()), entry.clone());
        Ok(())
    }

    async fn due_recoveries(&self, now: DateTime<Utc>) -> Result<Vec<RecoveryEntry>, StoreError> {
        let recovery = self.recovery.lock().unwrap();
        Ok(recovery
            .values()
            .filter(|entry| entry.due_at <= now)
            .cloned()
            .collect())
    }

    async fn remove_recovery(&self, account_id: &str) -> Result<(), StoreError> {
        let mut recovery = self.recovery.lock().unwrap();
        recovery.retain(|_, entry| entry.account_id != account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecoveryReason, TaskPriority};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn lock_is_first_writer_wins() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(60);
        assert!(locks.try_acquire("a", "invite-engine", ttl, now()).await.unwrap());
        assert!(!locks.try_acquire("a", "parse-engine", ttl, now()).await.unwrap());
        assert_eq!(
            locks.holder("a", now()).await.unwrap(),
            Some("invite-engine".to_string())
        );
    }

    #[tokio::test]
    async fn expired_lock_counts_as_free() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(60);
        assert!(locks.try_acquire("a", "one", ttl, now()).await.unwrap());
        let later = now() + chrono::Duration::seconds(61);
        assert!(locks.try_acquire("a", "two", ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_ignored() {
        let locks = MemoryLockStore::new();
        let ttl = Duration::from_secs(60);
        locks.try_acquire("a", "one", ttl, now()).await.unwrap();
        locks.release("a", "two").await.unwrap();
        assert_eq!(locks.holder("a", now()).await.unwrap(), Some("one".to_string()));
    }

    #[tokio::test]
    async fn recovery_entries_come_back_ordered_and_idempotent() {
        let locks = MemoryLockStore::new();
        let base = now();
        for (id, offset) in [("b", 10), ("a", 5), ("c", 20)] {
            locks
                .schedule_recovery(&RecoveryEntry {
                    account_id: id.to_string(),
                    due_at: base + chrono::Duration::minutes(offset),
                    reason: RecoveryReason::FloodWait,
                    failures: 0,
                })
                .await
                .unwrap();
        }

        let due = locks
            .due_recoveries(base + chrono::Duration::minutes(15))
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|entry| entry.account_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        // dequeue is idempotent until removed
        let again = locks
            .due_recoveries(base + chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(again.len(), 2);

        locks.remove_recovery("a").await.unwrap();
        let after = locks
            .due_recoveries(base + chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn pending_tasks_dispatch_priority_major_fifo_within() {
        let store = MemoryStateStore::new();
        let base = now();

        let mut normal_old = TaskRecord::new_parse(
            1,
            TaskPriority::Normal,
            crate::models::ParseSettings {
                sources: vec!["@one".to_string()],
                speed: crate::config::SpeedProfile::Safe,
            },
            base,
        );
        normal_old.task_id = "task_a".to_string();
        let mut high_new = normal_old.clone();
        high_new.task_id = "task_b".to_string();
        high_new.priority = TaskPriority::High;
        high_new.created_at = base + chrono::Duration::minutes(5);

        store.create_task(&normal_old).await.unwrap();
        store.create_task(&high_new).await.unwrap();

        let next = store.next_pending_task().await.unwrap().unwrap();
        assert_eq!(next.task_id, "task_b");
    }

    #[tokio::test]
    async fn optimistic_session_update_detects_conflicts() {
        let store = MemoryStateStore::new();
        let record = SessionRecord::new("s1".to_string(), 1, "+1".to_string(), vec![]);
        store.create_session(&record).await.unwrap();

        let fresh = store.get_session("s1").await.unwrap().unwrap();
        let updated = store.update_session(&fresh).await.unwrap();
        assert_eq!(updated.version, fresh.version + 1);

        // writing through the stale snapshot now conflicts
        let result = store.update_session(&fresh).await;
        assert!(matches!(result, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn requeued_target_rejoins_at_the_head() {
        let store = MemoryStateStore::new();
        let at = now();
        let make = |id: &str, position: i64| TargetRecord {
            target_id: id.to_string(),
            task_id: "task".to_string(),
            username: Some(id.to_string()),
            phone: None,
            platform_user_id: None,
            display_name: None,
            status: TargetStatus::Pending,
            attempts: 0,
            last_error_kind: None,
            last_account_id: None,
            position,
            updated_at: at,
        };
        store
            .insert_targets(&[make("t1", 1), make("t2", 2), make("t3", 3)])
            .await
            .unwrap();

        // t2 dispatched, flood-waited, requeued
        let mut t2 = store.get_target("t2").await.unwrap().unwrap();
        t2.status = TargetStatus::Skipped;
        store.update_target(&t2).await.unwrap();
        store.requeue_target_front("t2").await.unwrap();

        let next = store.next_pending_target("task").await.unwrap().unwrap();
        assert_eq!(next.target_id, "t2");
    }
}
