use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::SpeedProfile;

/// generates an opaque identifier with a readable prefix
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{:016x}", prefix, fastrand::u64(..))
}

// ---------------------------------------------------------------------------
// sessions

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    FloodWait,
    Blocked,
    Disabled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::FloodWait => "FLOOD_WAIT",
            SessionStatus::Blocked => "BLOCKED",
            SessionStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(SessionStatus::Active),
            "FLOOD_WAIT" => Some(SessionStatus::FloodWait),
            "BLOCKED" => Some(SessionStatus::Blocked),
            "DISABLED" => Some(SessionStatus::Disabled),
            _ => None,
        }
    }
}

/// per-(session, channel) invite counters; the lifetime count never resets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub invites_today: u32,
    pub invites_lifetime: u32,
}

/// one telegram user-session owned by one end-user.
///
/// state and counters are mutated exclusively by the account manager; the
/// broker only reads the blob and reports connect/disconnect times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub owner_user_id: i64,
    pub phone: String,
    /// sealed at rest under the per-session key; the broker opens it when
    /// reconstituting a live client
    #[serde(with = "blob_base64")]
    pub session_blob: Vec<u8>,
    pub status: SessionStatus,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub flood_wait_until: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub invites_today: u32,
    pub messages_today: u32,
    pub contacts_today: u32,
    /// day anchor for the lazy daily reset
    pub counters_day: NaiveDate,
    pub per_channel: HashMap<String, ChannelStats>,
    /// timestamps of recent successful invites, pruned to the last 24h;
    /// drives the hourly window, the cooldown and the burst guard
    pub recent_invites: Vec<DateTime<Utc>>,
    pub last_invite_at: Option<DateTime<Utc>>,
    /// optimistic concurrency version
    pub version: i64,
}

impl SessionRecord {
    pub fn new(session_id: String, owner_user_id: i64, phone: String, blob: Vec<u8>) -> Self {
        Self {
            session_id,
            owner_user_id,
            phone,
            session_blob: blob,
            status: SessionStatus::Active,
            locked_by: None,
            lock_expires_at: None,
            flood_wait_until: None,
            blocked_until: None,
            error_count: 0,
            last_used_at: None,
            invites_today: 0,
            messages_today: 0,
            contacts_today: 0,
            counters_day: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
            per_channel: HashMap::new(),
            recent_invites: Vec::new(),
            last_invite_at: None,
            version: 0,
        }
    }

    /// the utc day a timestamp belongs to, given the configured rollover hour
    pub fn effective_day(now: DateTime<Utc>, reset_hour: u32) -> NaiveDate {
        (now - Duration::hours(reset_hour as i64)).date_naive()
    }

    /// lazily rolls the daily counters over the configured utc boundary and
    /// prunes stale invite timestamps; lifetime counters are left intact
    pub fn roll_day(&mut self, now: DateTime<Utc>, reset_hour: u32) {
        let today = Self::effective_day(now, reset_hour);
        if self.counters_day != today {
            self.counters_day = today;
            self.invites_today = 0;
            self.messages_today = 0;
            self.contacts_today = 0;
            for stats in self.per_channel.values_mut() {
                stats.invites_today = 0;
            }
        }
        let horizon = now - Duration::hours(24);
        self.recent_invites.retain(|at| *at > horizon);
    }

    /// invites recorded within the sliding window ending at `now`
    pub fn invites_within(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        let from = now - window;
        self.recent_invites.iter().filter(|at| **at > from).count() as u32
    }

    pub fn channel_stats(&self, channel: &str) -> ChannelStats {
        self.per_channel.get(channel).cloned().unwrap_or_default()
    }

    /// true when the lock row no longer guards the session
    pub fn lock_free(&self, now: DateTime<Utc>) -> bool {
        match self.lock_expires_at {
            Some(expires) => expires <= now,
            None => true,
        }
    }
}

// serialize session blobs as base64 text so records stay json-encodable
mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// tasks

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Parse,
    Invite,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Parse => "PARSE",
            TaskKind::Invite => "INVITE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    /// higher rank dispatches first
    pub fn rank(&self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteType {
    GroupInvite,
    DirectMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseSettings {
    pub sources: Vec<String>,
    pub speed: SpeedProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteSettings {
    pub invite_type: InviteType,
    /// target group handle for group-invite campaigns
    pub group_id: Option<String>,
    /// message body for direct-message campaigns
    pub message_text: Option<String>,
    /// count an already-participant target as a success
    pub already_participant_is_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSettings {
    Parse(ParseSettings),
    Invite(InviteSettings),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    Planned,
    Running,
    /// waiting for an account to recover before fetching continues
    Suspended,
    Done,
    Failed,
}

/// per-source progress of a parse task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProgress {
    pub link: String,
    pub status: SourceStatus,
    pub last_offset: Option<i32>,
    pub results: u64,
    pub estimated: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseCounters {
    pub processed_messages: u64,
    pub processed_media: u64,
    pub processed_users: u64,
    pub estimated_total: u64,
    pub progress_percent: u8,
    pub sources: Vec<SourceProgress>,
}

impl ParseCounters {
    pub fn processed(&self) -> u64 {
        self.processed_messages + self.processed_media + self.processed_users
    }

    /// recomputes the displayed percentage, clamped to 100; the estimate is a
    /// heuristic and may undercount
    pub fn refresh_progress(&mut self) {
        if self.estimated_total == 0 {
            self.progress_percent = 0;
            return;
        }
        let percent = self.processed() * 100 / self.estimated_total;
        self.progress_percent = percent.min(100) as u8;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InviteCounters {
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskCounters {
    Parse(ParseCounters),
    Invite(InviteCounters),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub owner_user_id: i64,
    pub kind: TaskKind,
    pub platform: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub settings: TaskSettings,
    pub counters: TaskCounters,
    pub pause_reason: Option<String>,
    /// when a system-paused task re-arms itself
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl TaskRecord {
    pub fn new_parse(
        owner_user_id: i64,
        priority: TaskPriority,
        settings: ParseSettings,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: generate_id("task"),
            owner_user_id,
            kind: TaskKind::Parse,
            platform: "telegram".to_string(),
            status: TaskStatus::Pending,
            priority,
            settings: TaskSettings::Parse(settings),
            counters: TaskCounters::Parse(ParseCounters::default()),
            pause_reason: None,
            resume_at: None,
            created_at,
            updated_at: created_at,
            version: 0,
        }
    }

    pub fn new_invite(
        owner_user_id: i64,
        priority: TaskPriority,
        settings: InviteSettings,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: generate_id("task"),
            owner_user_id,
            kind: TaskKind::Invite,
            platform: "telegram".to_string(),
            status: TaskStatus::Pending,
            priority,
            settings: TaskSettings::Invite(settings),
            counters: TaskCounters::Invite(InviteCounters::default()),
            pause_reason: None,
            resume_at: None,
            created_at,
            updated_at: created_at,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// targets

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Pending,
    Invited,
    Failed,
    Skipped,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "PENDING",
            TargetStatus::Invited => "INVITED",
            TargetStatus::Failed => "FAILED",
            TargetStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TargetStatus::Pending)
    }
}

/// one planned unit of work inside an invite task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub target_id: String,
    pub task_id: String,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub platform_user_id: Option<i64>,
    pub display_name: Option<String>,
    pub status: TargetStatus,
    pub attempts: u32,
    pub last_error_kind: Option<String>,
    pub last_account_id: Option<String>,
    /// dispatch ordering key; a requeued target takes the smallest position
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

impl TargetRecord {
    pub fn has_identifier(&self) -> bool {
        self.username.is_some() || self.phone.is_some() || self.platform_user_id.is_some()
    }

    /// the most specific identifier, for logs
    pub fn describe(&self) -> String {
        if let Some(username) = &self.username {
            return format!("@{}", username.trim_start_matches('@'));
        }
        if let Some(phone) = &self.phone {
            return phone.clone();
        }
        if let Some(id) = self.platform_user_id {
            return format!("id:{}", id);
        }
        "<no identifier>".to_string()
    }
}

// ---------------------------------------------------------------------------
// parse results

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseResultKind {
    Message,
    Media,
    Participant,
    Community,
}

impl ParseResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseResultKind::Message => "MESSAGE",
            ParseResultKind::Media => "MEDIA",
            ParseResultKind::Participant => "PARTICIPANT",
            ParseResultKind::Community => "COMMUNITY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResultRecord {
    pub result_id: String,
    pub task_id: String,
    pub kind: ParseResultKind,
    /// source channel/message key on the platform
    pub platform_key: String,
    /// structured payload; binary fields arrive base64-encoded, datetimes as
    /// rfc-3339 strings
    pub payload: serde_json::Value,
    pub discovered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// execution log

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Success,
    Failed,
    Skipped,
    SystemError,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Success => "SUCCESS",
            ActionOutcome::Failed => "FAILED",
            ActionOutcome::Skipped => "SKIPPED",
            ActionOutcome::SystemError => "SYSTEM_ERROR",
        }
    }
}

/// append-only audit entry; one per dispatched operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogRecord {
    pub log_id: String,
    pub task_id: String,
    pub target_id: Option<String>,
    pub account_id: Option<String>,
    pub action: String,
    pub outcome: ActionOutcome,
    pub error_kind: Option<String>,
    pub message: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// recovery schedule

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryReason {
    FloodWait,
    PeerFlood,
    BanReview,
}

impl RecoveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryReason::FloodWait => "FLOOD_WAIT",
            RecoveryReason::PeerFlood => "PEER_FLOOD",
            RecoveryReason::BanReview => "BAN_REVIEW",
        }
    }
}

/// pending wake-up for an account under cool-down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub account_id: String,
    pub due_at: DateTime<Utc>,
    pub reason: RecoveryReason,
    pub failures: u32,
}
