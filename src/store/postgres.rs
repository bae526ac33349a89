use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres_rustls::MakeRustlsConnect;

use super::{LockStore, StateStore, StoreError};
use crate::error::BoxError;
use crate::models::{
    ActionOutcome, ChannelStats, ExecutionLogRecord, ParseResultKind, ParseResultRecord,
    RecoveryEntry, RecoveryReason, SessionRecord, SessionStatus, TargetRecord, TargetStatus,
    TaskCounters, TaskKind, TaskPriority, TaskRecord, TaskSettings, TaskStatus,
};

/// creates the shared connection pool with rustls tls
pub async fn create_pool(database_url: &str) -> Result<Pool, BoxError> {
    let mut config = Config::new();
    config.url = Some(database_url.to_string());
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls = MakeRustlsConnect::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let pool = config.create_pool(Some(Runtime::Tokio1), tls)?;
    Ok(pool)
}

fn backend(e: impl Into<BoxError>) -> StoreError {
    StoreError::Backend(e.into())
}

/// durable state store on postgres
pub struct PgStateStore {
    pool: Pool,
}

impl PgStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn row_to_session(row: &tokio_postgres::Row) -> Result<SessionRecord, StoreError> {
        let status_text: String = row.get("status");
        let status = SessionStatus::parse(&status_text)
            .ok_or_else(|| backend(format!("unknown session status: {}", status_text)))?;
        let per_channel_json: serde_json::Value = row.get("per_channel_map");
        let per_channel: HashMap<String, ChannelStats> =
            serde_json::from_value(per_channel_json).map_err(backend)?;
        let recent_json: serde_json::Value = row.get("recent_invites");
        let recent_invites: Vec<DateTime<Utc>> =
            serde_json::from_value(recent_json).map_err(backend)?;

        Ok(SessionRecord {
            session_id: row.get("session_id"),
            owner_user_id: row.get("owner_user_id"),
            phone: row.get("phone"),
            session_blob: row.get("session_blob"),
            status,
            locked_by: row.get("locked_by"),
            lock_expires_at: row.get("lock_expires_at"),
            flood_wait_until: row.get("flood_wait_until"),
            blocked_until: row.get("blocked_until"),
            error_count: row.get::<_, i32>("error_count") as u32,
            last_used_at: row.get("last_used_at"),
            invites_today: row.get::<_, i32>("invites_today") as u32,
            messages_today: row.get::<_, i32>("messages_today") as u32,
            contacts_today: row.get::<_, i32>("contacts_today") as u32,
            counters_day: row.get::<_, NaiveDate>("counters_day"),
            per_channel,
            recent_invites,
            last_invite_at: row.get("last_invite_at"),
            version: row.get("version"),
        })
    }

    fn row_to_task(row: &tokio_postgres::Row) -> Result<TaskRecord, StoreError> {
        let kind_text: String = row.get("kind");
        let kind = match kind_text.as_str() {
            "PARSE" => TaskKind::Parse,
            "INVITE" => TaskKind::Invite,
            other => return Err(backend(format!("unknown task kind: {}", other))),
        };
        let status_text: String = row.get("status");
        let status = match status_text.as_str() {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "PAUSED" => TaskStatus::Paused,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            other => return Err(backend(format!("unknown task status: {}", other))),
        };
        let priority = match row.get::<_, i32>("priority") {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            _ => TaskPriority::Normal,
        };
        let settings: TaskSettings =
            serde_json::from_value(row.get::<_, serde_json::Value>("settings")).map_err(backend)?;
        let counters: TaskCounters =
            serde_json::from_value(row.get::<_, serde_json::Value>("counters")).map_err(backend)?;

        Ok(TaskRecord {
            task_id: row.get("task_id"),
            owner_user_id: row.get("owner_user_id"),
            kind,
            platform: row.get("platform"),
            status,
            priority,
            settings,
            counters,
            pause_reason: row.get("pause_reason"),
            resume_at: row.get("resume_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            version: row.get("version"),
        })
    }

    fn row_to_target(row: &tokio_postgres::Row) -> Result<TargetRecord, StoreError> {
        let identifiers: serde_json::Value = row.get("identifiers");
        let status_text: String = row.get("status");
        let status = match status_text.as_str() {
            "PENDING" => TargetStatus::Pending,
            "INVITED" => TargetStatus::Invited,
            "FAILED" => TargetStatus::Failed,
            "SKIPPED" => TargetStatus::Skipped,
            other => return Err(backend(format!("unknown target status: {}", other))),
        };

        Ok(TargetRecord {
            target_id: row.get("target_id"),
            task_id: row.get("task_id"),
            username: identifiers
                .get("username")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string()),
            phone: identifiers
                .get("phone")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string()),
            platform_user_id: identifiers.get("platform_user_id").and_then(|v| v.as_i64()),
            display_name: identifiers
                .get("display_name")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string()),
            status,
            attempts: row.get::<_, i32>("attempts") as u32,
            last_error_kind: row.get("last_error_kind"),
            last_account_id: row.get("last_account_id"),
            position: row.get("position"),
            updated_at: row.get("updated_at"),
        })
    }

    fn target_identifiers(record: &TargetRecord) -> serde_json::Value {
        serde_json::json!({
            "username": record.username,
            "phone": record.phone,
            "platform_user_id": record.platform_user_id,
            "display_name": record.display_name,
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let per_channel = serde_json::to_value(&record.per_channel).map_err(backend)?;
        let recent = serde_json::to_value(&record.recent_invites).map_err(backend)?;
        client
            .execute(
                "INSERT INTO sessions (session_id, owner_user_id, phone, session_blob, status,
                     locked_by, lock_expires_at, flood_wait_until, blocked_until, error_count,
                     last_used_at, invites_today, messages_today, contacts_today, counters_day,
                     per_channel_map, recent_invites, last_invite_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
                &[
                    &record.session_id,
                    &record.owner_user_id,
                    &record.phone,
                    &record.session_blob,
                    &record.status.as_str(),
                    &record.locked_by,
                    &record.lock_expires_at,
                    &record.flood_wait_until,
                    &record.blocked_until,
                    &(record.error_count as i32),
                    &record.last_used_at,
                    &(record.invites_today as i32),
                    &(record.messages_today as i32),
                    &(record.contacts_today as i32),
                    &record.counters_day,
                    &per_channel,
                    &recent,
                    &record.last_invite_at,
                    &record.version,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt("SELECT * FROM sessions WHERE session_id = $1", &[&session_id])
            .await
            .map_err(backend)?;
        row.map(|row| Self::row_to_session(&row)).transpose()
    }

    async fn list_sessions(&self, owner_user_id: i64) -> Result<Vec<SessionRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let rows = client
            .query(
                "SELECT * FROM sessions WHERE owner_user_id = $1 ORDER BY session_id",
                &[&owner_user_id],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn update_session(&self, record: &SessionRecord) -> Result<SessionRecord, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let per_channel = serde_json::to_value(&record.per_channel).map_err(backend)?;
        let recent = serde_json::to_value(&record.recent_invites).map_err(backend)?;
        let updated = client
            .execute(
                "UPDATE sessions SET phone = $2, session_blob = $3, status = $4, locked_by = $5,
                     lock_expires_at = $6, flood_wait_until = $7, blocked_until = $8,
                     error_count = $9, last_used_at = $10, invites_today = $11,
                     messages_today = $12, contacts_today = $13, counters_day = $14,
                     per_channel_map = $15, recent_invites = $16, last_invite_at = $17,
                     version = version + 1, updated_at = NOW()
                 WHERE session_id = $1 AND version = $18",
                &[
                    &record.session_id,
                    &record.phone,
                    &record.session_blob,
                    &record.status.as_str(),
                    &record.locked_by,
                    &record.lock_expires_at,
                    &record.flood_wait_until,
                    &record.blocked_until,
                    &(record.error_count as i32),
                    &record.last_used_at,
                    &(record.invites_today as i32),
                    &(record.messages_today as i32),
                    &(record.contacts_today as i32),
                    &record.counters_day,
                    &per_channel,
                    &recent,
                    &record.last_invite_at,
                    &record.version,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::Conflict);
        }
        let mut stored = record.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn create_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let settings = serde_json::to_value(&record.settings).map_err(backend)?;
        let counters = serde_json::to_value(&record.counters).map_err(backend)?;
        client
            .execute(
                "INSERT INTO tasks (task_id, owner_user_id, kind, platform, status, priority,
                     settings, counters, pause_reason, resume_at, created_at, updated_at, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &record.task_id,
                    &record.owner_user_id,
                    &record.kind.as_str(),
                    &record.platform,
                    &record.status.as_str(),
                    &record.priority.rank(),
                    &settings,
                    &counters,
                    &record.pause_reason,
                    &record.resume_at,
                    &record.created_at,
                    &record.updated_at,
                    &record.version,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt("SELECT * FROM tasks WHERE task_id = $1", &[&task_id])
            .await
            .map_err(backend)?;
        row.map(|row| Self::row_to_task(&row)).transpose()
    }

    async fn update_task(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let settings = serde_json::to_value(&record.settings).map_err(backend)?;
        let counters = serde_json::to_value(&record.counters).map_err(backend)?;
        let updated = client
            .execute(
                "UPDATE tasks SET status = $2, priority = $3, settings = $4, counters = $5,
                     pause_reason = $6, resume_at = $7, updated_at = NOW(), version = version + 1
                 WHERE task_id = $1 AND version = $8",
                &[
                    &record.task_id,
                    &record.status.as_str(),
                    &record.priority.rank(),
                    &settings,
                    &counters,
                    &record.pause_reason,
                    &record.resume_at,
                    &record.version,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::Conflict);
        }
        let mut stored = record.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn next_pending_task(&self) -> Result<Option<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt(
                "SELECT * FROM tasks WHERE status = 'PENDING'
                 ORDER BY priority DESC, created_at ASC, task_id ASC LIMIT 1",
                &[],
            )
            .await
            .map_err(backend)?;
        row.map(|row| Self::row_to_task(&row)).transpose()
    }

    async fn due_resumable_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let rows = client
            .query(
                "SELECT * FROM tasks WHERE status = 'PAUSED' AND resume_at IS NOT NULL
                     AND resume_at <= $1
                 ORDER BY priority DESC, created_at ASC",
                &[&now],
            )
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn insert_targets(&self, targets: &[TargetRecord]) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        for record in targets {
            let identifiers = Self::target_identifiers(record);
            client
                .execute(
                    "INSERT INTO targets (target_id, task_id, identifiers, status, attempts,
                         last_error_kind, last_account_id, position, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                    &[
                        &record.target_id,
                        &record.task_id,
                        &identifiers,
                        &record.status.as_str(),
                        &(record.attempts as i32),
                        &record.last_error_kind,
                        &record.last_account_id,
                        &record.position,
                        &record.updated_at,
                    ],
                )
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn get_target(&self, target_id: &str) -> Result<Option<TargetRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt("SELECT * FROM targets WHERE target_id = $1", &[&target_id])
            .await
            .map_err(backend)?;
        row.map(|row| Self::row_to_target(&row)).transpose()
    }

    async fn update_target(&self, record: &TargetRecord) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let identifiers = Self::target_identifiers(record);
        let updated = client
            .execute(
                "UPDATE targets SET identifiers = $2, status = $3, attempts = $4,
                     last_error_kind = $5, last_account_id = $6, position = $7, updated_at = $8
                 WHERE target_id = $1",
                &[
                    &record.target_id,
                    &identifiers,
                    &record.status.as_str(),
                    &(record.attempts as i32),
                    &record.last_error_kind,
                    &record.last_account_id,
                    &record.position,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn next_pending_target(
        &self,
        task_id: &str,
    ) -> Result<Option<TargetRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt(
                "SELECT * FROM targets WHERE task_id = $1 AND status = 'PENDING'
                 ORDER BY position ASC, target_id ASC LIMIT 1",
                &[&task_id],
            )
            .await
            .map_err(backend)?;
        row.map(|row| Self::row_to_target(&row)).transpose()
    }

    async fn requeue_target_front(&self, target_id: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let updated = client
            .execute(
                "UPDATE targets SET status = 'PENDING', updated_at = NOW(),
                     position = COALESCE((SELECT MIN(t.position) FROM targets t
                         WHERE t.task_id = targets.task_id AND t.status = 'PENDING'), 0) - 1
                 WHERE target_id = $1",
                &[&target_id],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn count_targets(
        &self,
        task_id: &str,
        status: TargetStatus,
    ) -> Result<u64, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM targets WHERE task_id = $1 AND status = $2",
                &[&task_id, &status.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn insert_parse_results(
        &self,
        results: &[ParseResultRecord],
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        for record in results {
            client
                .execute(
                    "INSERT INTO parse_results (result_id, task_id, kind, platform_key, payload, discovered_at)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &record.result_id,
                        &record.task_id,
                        &record.kind.as_str(),
                        &record.platform_key,
                        &record.payload,
                        &record.discovered_at,
                    ],
                )
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn count_parse_results(&self, task_id: &str) -> Result<u64, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM parse_results WHERE task_id = $1",
                &[&task_id],
            )
            .await
            .map_err(backend)?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn parse_results_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<ParseResultRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let rows = client
            .query(
                "SELECT * FROM parse_results WHERE task_id = $1 ORDER BY discovered_at ASC",
                &[&task_id],
            )
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                let kind_text: String = row.get("kind");
                let kind = match kind_text.as_str() {
                    "MESSAGE" => ParseResultKind::Message,
                    "MEDIA" => ParseResultKind::Media,
                    "PARTICIPANT" => ParseResultKind::Participant,
                    "COMMUNITY" => ParseResultKind::Community,
                    other => return Err(backend(format!("unknown result kind: {}", other))),
                };
                Ok(ParseResultRecord {
                    result_id: row.get("result_id"),
                    task_id: row.get("task_id"),
                    kind,
                    platform_key: row.get("platform_key"),
                    payload: row.get("payload"),
                    discovered_at: row.get("discovered_at"),
                })
            })
            .collect()
    }

    async fn append_log(&self, entry: &ExecutionLogRecord) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        client
            .execute(
                "INSERT INTO execution_logs (log_id, task_id, target_id, account_id, action,
                     outcome, error_kind, message, duration_ms, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &entry.log_id,
                    &entry.task_id,
                    &entry.target_id,
                    &entry.account_id,
                    &entry.action,
                    &entry.outcome.as_str(),
                    &entry.error_kind,
                    &entry.message,
                    &(entry.duration_ms as i64),
                    &entry.created_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn logs_for_task(&self, task_id: &str) -> Result<Vec<ExecutionLogRecord>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let rows = client
            .query(
                "SELECT * FROM execution_logs WHERE task_id = $1 ORDER BY created_at ASC",
                &[&task_id],
            )
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                let outcome_text: String = row.get("outcome");
                let outcome = match outcome_text.as_str() {
                    "SUCCESS" => ActionOutcome::Success,
                    "FAILED" => ActionOutcome::Failed,
                    "SKIPPED" => ActionOutcome::Skipped,
                    _ => ActionOutcome::SystemError,
                };
                Ok(ExecutionLogRecord {
                    log_id: row.get("log_id"),
                    task_id: row.get("task_id"),
                    target_id: row.get("target_id"),
                    account_id: row.get("account_id"),
                    action: row.get("action"),
                    outcome,
                    error_kind: row.get("error_kind"),
                    message: row.get("message"),
                    duration_ms: row.get::<_, i64>("duration_ms") as u64,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

/// postgres-backed lock store; acquisition is a compare-and-swap upsert, so
/// two racing callers resolve first-writer-wins inside the database
pub struct PgLockStore {
    pool: Pool,
}

impl PgLockStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let updated = client
            .execute(
                "INSERT INTO account_locks (account_id, holder, expires_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (account_id) DO UPDATE
                     SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                     WHERE account_locks.expires_at <= $4
                        OR account_locks.holder = EXCLUDED.holder",
                &[&account_id, &holder, &expires_at, &now],
            )
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn extend(
        &self,
        account_id: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let updated = client
            .execute(
                "UPDATE account_locks SET expires_at = $3
                 WHERE account_id = $1 AND holder = $2 AND expires_at > $4",
                &[&account_id, &holder, &expires_at, &now],
            )
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn release(&self, account_id: &str, holder: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        client
            .execute(
                "DELETE FROM account_locks WHERE account_id = $1 AND holder = $2",
                &[&account_id, &holder],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn holder(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let row = client
            .query_opt(
                "SELECT holder FROM account_locks WHERE account_id = $1 AND expires_at > $2",
                &[&account_id, &now],
            )
            .await
            .map_err(backend)?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn schedule_recovery(&self, entry: &RecoveryEntry) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        client
            .execute(
                "INSERT INTO recovery_schedule (account_id, due_at, reason, failures)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (account_id) DO UPDATE
                     SET due_at = EXCLUDED.due_at, reason = EXCLUDED.reason,
                         failures = EXCLUDED.failures",
                &[
                    &entry.account_id,
                    &entry.due_at,
                    &entry.reason.as_str(),
                    &(entry.failures as i32),
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn due_recoveries(&self, now: DateTime<Utc>) -> Result<Vec<RecoveryEntry>, StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        let rows = client
            .query(
                "SELECT account_id, due_at, reason, failures FROM recovery_schedule
                 WHERE due_at <= $1 ORDER BY due_at ASC",
                &[&now],
            )
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|row| {
                let reason_text: String = row.get("reason");
                let reason = match reason_text.as_str() {
                    "PEER_FLOOD" => RecoveryReason::PeerFlood,
                    "BAN_REVIEW" => RecoveryReason::BanReview,
                    _ => RecoveryReason::FloodWait,
                };
                RecoveryEntry {
                    account_id: row.get("account_id"),
                    due_at: row.get("due_at"),
                    reason,
                    failures: row.get::<_, i32>("failures") as u32,
                }
            })
            .collect())
    }

    async fn remove_recovery(&self, account_id: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await.map_err(backend)?;
        client
            .execute(
                "DELETE FROM recovery_schedule WHERE account_id = $1",
                &[&account_id],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }
}
