use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use tg_orchestra::account::recovery::RecoveryWorker;
use tg_orchestra::account::AccountManager;
use tg_orchestra::broker::SessionBroker;
use tg_orchestra::clock::ManualClock;
use tg_orchestra::config::{OrchestratorConfig, SpeedProfile};
use tg_orchestra::engine::{InviteEngine, ParseEngine};
use tg_orchestra::models::{
    generate_id, InviteSettings, InviteType, ParseSettings, SessionRecord, TargetRecord,
    TargetStatus, TaskPriority, TaskRecord, TaskStatus,
};
use tg_orchestra::store::memory::{MemoryLockStore, MemoryStateStore};
use tg_orchestra::store::StateStore;
use tg_orchestra::telemetry::Telemetry;

use super::mock_broker::MockBroker;

/// everything a scenario needs: in-memory stores, a scripted broker, a
/// manually advanced clock and both engines wired together
pub struct TestEnv {
    pub store: Arc<MemoryStateStore>,
    pub locks: Arc<MemoryLockStore>,
    pub clock: Arc<ManualClock>,
    pub broker: Arc<MockBroker>,
    pub accounts: Arc<AccountManager>,
    pub invite: InviteEngine,
    pub parse: ParseEngine,
    pub recovery: RecoveryWorker,
    pub telemetry: Arc<Telemetry>,
    pub config: OrchestratorConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let config = OrchestratorConfig::default();
        let store = Arc::new(MemoryStateStore::new());
        let locks = Arc::new(MemoryLockStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let broker = Arc::new(MockBroker::new());
        let telemetry = Arc::new(Telemetry::new());

        let accounts = Arc::new(AccountManager::new(
            store.clone(),
            locks.clone(),
            clock.clone(),
            config.clone(),
            telemetry.clone(),
        ));
        let invite = InviteEngine::new(
            store.clone(),
            accounts.clone(),
            broker.clone() as Arc<dyn SessionBroker>,
            clock.clone(),
            config.clone(),
            telemetry.clone(),
        );
        let parse = ParseEngine::new(
            store.clone(),
            accounts.clone(),
            broker.clone() as Arc<dyn SessionBroker>,
            clock.clone(),
            config.clone(),
            telemetry.clone(),
        );
        let recovery = RecoveryWorker::new(
            store.clone(),
            locks.clone(),
            broker.clone() as Arc<dyn SessionBroker>,
            clock.clone(),
            config.clone(),
            telemetry.clone(),
        );

        Self {
            store,
            locks,
            clock,
            broker,
            accounts,
            invite,
            parse,
            recovery,
            telemetry,
            config,
        }
    }

    pub async fn add_session(&self, session_id: &str, owner_user_id: i64) -> SessionRecord {
        let record = SessionRecord::new(
            session_id.to_string(),
            owner_user_id,
            format!("+7999{}", fastrand::u32(1000000..9999999)),
            vec![1, 2, 3, 4],
        );
        self.store.create_session(&record).await.unwrap();
        record
    }

    pub async fn session(&self, session_id: &str) -> SessionRecord {
        self.store.get_session(session_id).await.unwrap().unwrap()
    }

    /// creates a group-invite task with pending targets, already RUNNING
    pub async fn add_invite_task(
        &self,
        owner_user_id: i64,
        group: &str,
        targets: &[&str],
    ) -> TaskRecord {
        let settings = InviteSettings {
            invite_type: InviteType::GroupInvite,
            group_id: Some(group.to_string()),
            message_text: None,
            already_participant_is_success: true,
        };
        let mut task =
            TaskRecord::new_invite(owner_user_id, TaskPriority::Normal, settings, self.now());
        task.status = TaskStatus::Running;
        self.store.create_task(&task).await.unwrap();
        self.add_targets(&task.task_id, targets).await;
        self.store.get_task(&task.task_id).await.unwrap().unwrap()
    }

    pub async fn add_parse_task(&self, owner_user_id: i64, sources: &[&str]) -> TaskRecord {
        let settings = ParseSettings {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            speed: SpeedProfile::Fast,
        };
        let task =
            TaskRecord::new_parse(owner_user_id, TaskPriority::Normal, settings, self.now());
        self.store.create_task(&task).await.unwrap();
        task
    }

    pub async fn add_targets(&self, task_id: &str, usernames: &[&str]) {
        let records: Vec<TargetRecord> = usernames
            .iter()
            .enumerate()
            .map(|(index, username)| TargetRecord {
                target_id: generate_id("tgt"),
                task_id: task_id.to_string(),
                username: Some(username.trim_start_matches('@').to_string()),
                phone: None,
                platform_user_id: None,
                display_name: None,
                status: TargetStatus::Pending,
                attempts: 0,
                last_error_kind: None,
                last_account_id: None,
                position: index as i64 + 1,
                updated_at: self.now(),
            })
            .collect();
        self.store.insert_targets(&records).await.unwrap();
    }

    pub async fn task(&self, task_id: &str) -> TaskRecord {
        self.store.get_task(task_id).await.unwrap().unwrap()
    }

    pub async fn targets_with_status(&self, task_id: &str, status: TargetStatus) -> u64 {
        self.store.count_targets(task_id, status).await.unwrap()
    }

    pub fn now(&self) -> DateTime<Utc> {
        use tg_orchestra::clock::Clock;
        self.clock.now()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).unwrap()
}
