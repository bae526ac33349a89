use deadpool_postgres::Pool;
use log::info;

use crate::error::BoxError;

/// schema revision this build writes and expects
const SCHEMA_VERSION: i32 = 1;

const SCHEMA_DDL: &str = r#"
    -- Single-row schema revision marker
    CREATE TABLE schema_info (
        version INTEGER NOT NULL,
        installed_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
    );

    -- Telegram user-sessions and their runtime counters
    CREATE TABLE sessions (
        session_id VARCHAR(64) PRIMARY KEY,
        owner_user_id BIGINT NOT NULL,
        phone VARCHAR(32) NOT NULL,
        session_blob BYTEA NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'ACTIVE',
        locked_by VARCHAR(128),
        lock_expires_at TIMESTAMP WITH TIME ZONE,
        flood_wait_until TIMESTAMP WITH TIME ZONE,
        blocked_until TIMESTAMP WITH TIME ZONE,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_used_at TIMESTAMP WITH TIME ZONE,
        invites_today INTEGER NOT NULL DEFAULT 0,
        messages_today INTEGER NOT NULL DEFAULT 0,
        contacts_today INTEGER NOT NULL DEFAULT 0,
        counters_day DATE NOT NULL DEFAULT '1970-01-01',
        per_channel_map JSONB NOT NULL DEFAULT '{}',
        recent_invites JSONB NOT NULL DEFAULT '[]',
        last_invite_at TIMESTAMP WITH TIME ZONE,
        version BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
    );

    -- User-submitted workloads
    CREATE TABLE tasks (
        task_id VARCHAR(64) PRIMARY KEY,
        owner_user_id BIGINT NOT NULL,
        kind VARCHAR(16) NOT NULL,
        platform VARCHAR(32) NOT NULL DEFAULT 'telegram',
        status VARCHAR(16) NOT NULL DEFAULT 'PENDING',
        priority INTEGER NOT NULL DEFAULT 1,
        settings JSONB NOT NULL,
        counters JSONB NOT NULL,
        pause_reason VARCHAR(255),
        resume_at TIMESTAMP WITH TIME ZONE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL,
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL,
        version BIGINT NOT NULL DEFAULT 0
    );

    -- Planned units of work inside invite tasks
    CREATE TABLE targets (
        target_id VARCHAR(64) PRIMARY KEY,
        task_id VARCHAR(64) NOT NULL REFERENCES tasks(task_id),
        identifiers JSONB NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'PENDING',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error_kind VARCHAR(64),
        last_account_id VARCHAR(64),
        position BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL
    );

    -- Extracted records from parse tasks
    CREATE TABLE parse_results (
        result_id VARCHAR(64) PRIMARY KEY,
        task_id VARCHAR(64) NOT NULL REFERENCES tasks(task_id),
        kind VARCHAR(16) NOT NULL,
        platform_key VARCHAR(255) NOT NULL,
        payload JSONB NOT NULL,
        discovered_at TIMESTAMP WITH TIME ZONE NOT NULL
    );

    -- Append-only audit trail, one row per dispatched operation
    CREATE TABLE execution_logs (
        log_id VARCHAR(64) PRIMARY KEY,
        task_id VARCHAR(64) NOT NULL,
        target_id VARCHAR(64),
        account_id VARCHAR(64),
        action VARCHAR(32) NOT NULL,
        outcome VARCHAR(16) NOT NULL,
        error_kind VARCHAR(64),
        message TEXT NOT NULL,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL
    );

    -- Short-TTL account locks, CAS on (account_id)
    CREATE TABLE account_locks (
        account_id VARCHAR(64) PRIMARY KEY,
        holder VARCHAR(128) NOT NULL,
        expires_at TIMESTAMP WITH TIME ZONE NOT NULL
    );

    -- Pending wake-ups for accounts under cool-down
    CREATE TABLE recovery_schedule (
        account_id VARCHAR(64) PRIMARY KEY,
        due_at TIMESTAMP WITH TIME ZONE NOT NULL,
        reason VARCHAR(16) NOT NULL,
        failures INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX idx_sessions_owner_status ON sessions(owner_user_id, status);
    CREATE INDEX idx_tasks_dispatch ON tasks(status, priority, created_at);
    CREATE INDEX idx_targets_task_status ON targets(task_id, status);
    CREATE INDEX idx_targets_position ON targets(task_id, position);
    CREATE INDEX idx_parse_results_task ON parse_results(task_id);
    CREATE INDEX idx_execution_logs_task ON execution_logs(task_id, created_at);
    CREATE INDEX idx_recovery_due ON recovery_schedule(due_at);
"#;

/// bootstraps the schema on an empty database and verifies the revision on
/// every later start.
///
/// there is no in-place upgrade path yet: a database written by a different
/// revision aborts startup instead of being silently reinterpreted.
pub async fn ensure_schema(pool: &Pool) -> Result<(), BoxError> {
    let mut client = pool.get().await?;

    let marker: Option<String> = client
        .query_one("SELECT to_regclass('public.schema_info')::text", &[])
        .await?
        .get(0);

    if marker.is_none() {
        info!("Empty database, creating schema at revision {}", SCHEMA_VERSION);
        let transaction = client.transaction().await?;
        transaction.batch_execute(SCHEMA_DDL).await?;
        transaction
            .execute(
                "INSERT INTO schema_info (version) VALUES ($1)",
                &[&SCHEMA_VERSION],
            )
            .await?;
        transaction.commit().await?;
        return Ok(());
    }

    let row = client
        .query_opt("SELECT version FROM schema_info LIMIT 1", &[])
        .await?;
    let installed = row.map(|row| row.get::<_, i32>(0));
    match installed {
        Some(version) if version == SCHEMA_VERSION => {
            info!("Database schema at revision {}", version);
            Ok(())
        }
        Some(version) => Err(format!(
            "database schema revision {} does not match this build (expected {})",
            version, SCHEMA_VERSION
        )
        .into()),
        None => Err("schema_info table exists but carries no revision row".into()),
    }
}
