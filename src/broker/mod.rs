use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::SpeedProfile;
use crate::error::ClassifiedError;
use crate::models::TargetRecord;

pub mod onboarding;
pub mod registry;
pub mod telegram;

/// credentials the broker needs to open a live client for one session
#[derive(Debug, Clone)]
pub struct SessionRef {
    pub session_id: String,
    pub phone: String,
    pub session_blob: Vec<u8>,
}

/// entity classification, decided once at resolution time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Bot,
    /// small group chat
    Group,
    Megagroup,
    /// broadcast channel
    Broadcast,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Bot => "bot",
            EntityKind::Group => "group",
            EntityKind::Megagroup => "megagroup",
            EntityKind::Broadcast => "broadcast",
        }
    }

    pub fn is_community(&self) -> bool {
        matches!(
            self,
            EntityKind::Group | EntityKind::Megagroup | EntityKind::Broadcast
        )
    }
}

/// platform entity descriptor returned by `resolve_entity`
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub platform_id: i64,
    pub access_hash: Option<i64>,
    pub kind: EntityKind,
    pub username: Option<String>,
    pub title: String,
}

/// admin-rights verdict for one (session, channel) pair
#[derive(Debug, Clone)]
pub struct AdminRights {
    pub is_admin: bool,
    pub permissions: Vec<String>,
    pub has_required: bool,
}

/// the identifiers an invite/message dispatch carries for one target
#[derive(Debug, Clone)]
pub struct TargetIdentity {
    pub username: Option<String>,
    pub phone: Option<String>,
    pub platform_user_id: Option<i64>,
}

impl From<&TargetRecord> for TargetIdentity {
    fn from(record: &TargetRecord) -> Self {
        Self {
            username: record.username.clone(),
            phone: record.phone.clone(),
            platform_user_id: record.platform_user_id,
        }
    }
}

/// one fetched message, already normalised for persistence: datetimes are
/// utc, binary side-data stays as bytes until the sanitiser encodes it
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: i32,
    pub date: DateTime<Utc>,
    pub text: String,
    pub media_kind: Option<String>,
    pub media_bytes: Option<Vec<u8>>,
    pub reply_count: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryBatch {
    pub items: Vec<HistoryMessage>,
    /// pass back into the next `fetch_history` call; `None` means exhausted
    pub next_offset: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParticipantBatch {
    pub items: Vec<ParticipantInfo>,
    pub next_offset: Option<usize>,
}

/// the single owner of live platform connections.
///
/// every operation returns either its result or a [`ClassifiedError`]; raw
/// platform errors never cross this boundary.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// dereferences `@username`, `t.me/...` links, phone numbers and numeric
    /// ids uniformly
    async fn resolve_entity(
        &self,
        session: &SessionRef,
        handle: &str,
    ) -> Result<EntityDescriptor, ClassifiedError>;

    async fn verify_admin_rights(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        required_permissions: &[String],
    ) -> Result<AdminRights, ClassifiedError>;

    /// groups and megagroups trivially have comments; broadcast channels are
    /// probed by scanning recent messages for non-zero reply counts
    async fn check_comments_enabled(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
    ) -> Result<bool, ClassifiedError>;

    /// pulls one batch of history under the speed profile; drive repeatedly
    /// with the returned offset for the lazy full sequence
    async fn fetch_history(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        profile: SpeedProfile,
        offset_id: Option<i32>,
    ) -> Result<HistoryBatch, ClassifiedError>;

    async fn fetch_participants(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        profile: SpeedProfile,
        offset: usize,
    ) -> Result<ParticipantBatch, ClassifiedError>;

    async fn send_invite(
        &self,
        session: &SessionRef,
        channel: &EntityDescriptor,
        target: &TargetIdentity,
    ) -> Result<(), ClassifiedError>;

    async fn send_direct_message(
        &self,
        session: &SessionRef,
        target: &TargetIdentity,
        text: &str,
    ) -> Result<(), ClassifiedError>;

    /// cheap health probe used by the recovery loop
    async fn probe_session(&self, session: &SessionRef) -> Result<(), ClassifiedError>;

    /// drops the cached live client, if any
    async fn disconnect(&self, session_id: &str);
}

/// normalises a source link or handle to `@username` form.
///
/// accepts `@channel`, bare usernames, and `t.me/...` links; returns `None`
/// for anything that cannot name a public entity.
pub fn normalize_handle(input: &str) -> Option<String> {
    let input = input.trim();
    // valid telegram username: 5-32 chars, alphanumeric and underscore
    let username_regex = Regex::new(r"^@?([a-zA-Z0-9_]{5,32})$").unwrap();
    let tme_regex = Regex::new(r"^(?:https?://)?t\.me/([a-zA-Z0-9_]{5,32})/?$").unwrap();

    if let Some(captures) = username_regex.captures(input) {
        return Some(format!("@{}", &captures[1]));
    }
    if let Some(captures) = tme_regex.captures(input) {
        return Some(format!("@{}", &captures[1]));
    }
    None
}

/// true when the string looks like an international phone number
pub fn looks_like_phone(input: &str) -> bool {
    let trimmed = input.trim();
    let digits = trimmed.trim_start_matches('+');
    digits.len() >= 7 && digits.chars().all(|c| c.is_ascii_digit())
}
