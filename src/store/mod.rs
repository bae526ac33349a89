use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::BoxError;
use crate::models::{
    ExecutionLogRecord, ParseResultRecord, RecoveryEntry, SessionRecord, TargetRecord,
    TargetStatus, TaskRecord,
};

pub mod memory;
pub mod schema;
pub mod postgres;

#[derive(Debug)]
pub enum StoreError {
    /// optimistic concurrency failure; reload and retry
    Conflict,
    NotFound,
    Backend(BoxError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "state conflict"),
            StoreError::NotFound => write!(f, "record not found"),
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<BoxError> for StoreError {
    fn from(e: BoxError) -> Self {
        StoreError::Backend(e)
    }
}

/// durable store for sessions, tasks, targets, parse results and the
/// execution log.
///
/// session rows are written only by the account manager, task/target rows
/// only by the engines; the execution log is append-only.
#[async_trait]
pub trait StateStore: Send + Sync {
    // sessions
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn list_sessions(&self, owner_user_id: i64) -> Result<Vec<SessionRecord>, StoreError>;
    /// optimistic update keyed on `version`; returns the stored record with
    /// the bumped version, or [`StoreError::Conflict`]
    async fn update_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError>;

    // tasks
    async fn create_task(&self, record: &TaskRecord) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;
    async fn update_task(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError>;
    /// next dispatchable task: highest priority first, fifo within a band
    async fn next_pending_task(&self) -> Result<Option<TaskRecord>, StoreError>;
    /// system-paused tasks whose re-arm time has passed
    async fn due_resumable_tasks(&self, now: DateTime<Utc>)
        -> Result<Vec<TaskRecord>, StoreError>;

    // targets
    async fn insert_targets(&self, targets: &[TargetRecord]) -> Result<(), StoreError>;
    async fn get_target(&self, target_id: &str) -> Result<Option<TargetRecord>, StoreError>;
    async fn update_target(&self, record: &TargetRecord) -> Result<(), StoreError>;
    /// lowest-position pending target of the task
    async fn next_pending_target(&self, task_id: &str)
        -> Result<Option<TargetRecord>, StoreError>;
    /// moves the target to the head of the task's pending set
    async fn requeue_target_front(&self, target_id: &str) -> Result<(), StoreError>;
    async fn count_targets(&self, task_id: &str, status: TargetStatus)
        -> Result<u64, StoreError>;

    // parse results
    async fn insert_parse_results(&self, results: &[ParseResultRecord])
        -> Result<(), StoreError>;
    async fn count_parse_results(&self, task_id: &str) -> Result<u64, StoreError>;
    async fn parse_results_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<ParseResultRecord>, StoreError>;

    // execution log
    async fn append_log(&self, entry: &ExecutionLogRecord) -> Result<(), StoreError>;
    async fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLogRecord>, StoreError>;
}

/// short-ttl distributed locks plus the ordered recovery wake-up set.
///
/// this store answers "who holds this account right now"; the session row
/// mirrors the lock for observability but is never trusted for mutual
/// exclusion.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// compare-and-swap acquisition; first writer wins, expired locks count
    /// as free
    async fn try_acquire(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// refreshes the ttl; fails when the caller no longer holds the lock
    async fn extend(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn release(&self, account_id: &str, holder: &str) -> Result<(), StoreError>;
    async fn holder(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    /// inserts or replaces the account's wake-up entry
    async fn schedule_recovery(&self, entry: &RecoveryEntry) -> Result<(), StoreError>;
    /// entries whose due time has passed, ordered by due time; dequeue is
    /// idempotent, entries stay until removed or rescheduled
    async fn due_recoveries(&self, now: DateTime<Utc>) -> Result<Vec<RecoveryEntry>, StoreError>;
    async fn remove_recovery(&self, account_id: &str) -> Result<(), StoreError>;
}
