use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::SessionRef;
use crate::clock::Clock;
use crate::config::{AllocationConfig, OrchestratorConfig};
use crate::error::ErrorKind;
use crate::models::{
    RecoveryEntry, RecoveryReason, SessionRecord, SessionStatus,
};
use crate::store::{LockStore, StateStore, StoreError};
use crate::telemetry::Telemetry;

pub mod limits;
pub mod recovery;

use self::limits::{ActionKind, Decision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Parse,
    InviteCampaign,
    DirectMessage,
    AdminProbe,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Parse => "PARSE",
            Purpose::InviteCampaign => "INVITE_CAMPAIGN",
            Purpose::DirectMessage => "DIRECT_MESSAGE",
            Purpose::AdminProbe => "ADMIN_PROBE",
        }
    }

    pub fn lock_ttl(&self, allocation: &AllocationConfig) -> Duration {
        match self {
            Purpose::Parse => allocation.parse_lock_ttl,
            Purpose::InviteCampaign => allocation.invite_lock_ttl,
            Purpose::DirectMessage => allocation.message_lock_ttl,
            Purpose::AdminProbe => allocation.probe_lock_ttl,
        }
    }
}

/// exclusive, time-bounded grant of a session to one caller
#[derive(Debug, Clone)]
pub struct AccountAllocation {
    pub token: String,
    pub session_id: String,
    pub owner_user_id: i64,
    pub purpose: Purpose,
    pub session: SessionRef,
    /// counter snapshot at allocation time, used for release reconciliation
    pub invites_today: u32,
    pub messages_today: u32,
}

#[derive(Debug)]
pub enum AllocateError {
    /// every eligible session is locked, cooling down or out of budget
    NoAvailableAccount {
        retry_after: Option<DateTime<Utc>>,
    },
    UserHasNoSessions,
    Store(StoreError),
}

impl std::fmt::Display for AllocateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocateError::NoAvailableAccount { .. } => write!(f, "no available account"),
            AllocateError::UserHasNoSessions => write!(f, "user has no sessions"),
            AllocateError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AllocateError {}

#[derive(Debug)]
pub enum AccountError {
    /// the token does not match a live allocation
    InvalidAllocation,
    Store(StoreError),
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountError::InvalidAllocation => write!(f, "invalid allocation token"),
            AccountError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AccountError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Success,
    Failed(ErrorKind),
}

impl RecordOutcome {
    fn key(&self) -> String {
        match self {
            RecordOutcome::Success => "SUCCESS".to_string(),
            RecordOutcome::Failed(kind) => kind.code().to_string(),
        }
    }
}

/// what the caller actually did with the allocation, reported on release
#[derive(Debug, Clone, Default)]
pub struct UsageReport {
    pub invites: u32,
    pub messages: u32,
    pub contacts: u32,
    pub channels: Vec<String>,
}

struct LiveAllocation {
    session_id: String,
    caller: String,
    released: bool,
    /// idempotency keys of applied record/handle calls
    applied: HashSet<String>,
}

/// single source of truth for which session may be used by which caller
/// right now, and for the running totals against platform limits.
///
/// all counter writes in the system go through [`AccountManager::record_action`].
pub struct AccountManager {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    telemetry: Arc<Telemetry>,
    live: Mutex<HashMap<String, LiveAllocation>>,
    token_seq: AtomicU64,
}

impl AccountManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            config,
            telemetry,
            live: Mutex::new(HashMap::new()),
            token_seq: AtomicU64::new(1),
        }
    }

    /// composite selection score; lower is better
    fn score(&self, session: &SessionRecord, now: DateTime<Utc>) -> f64 {
        let weights = &self.config.allocation;
        let usage = (session.invites_today + session.messages_today) as f64;
        let idle_minutes = session
            .last_used_at
            .map(|at| (now - at).num_minutes().max(0) as f64)
            .unwrap_or(24.0 * 60.0);
        weights.weight_usage * usage + weights.weight_errors * session.error_count as f64
            - weights.weight_age * idle_minutes
    }

    fn purpose_budget_ok(&self, purpose: Purpose, session: &SessionRecord) -> bool {
        let limits = &self.config.limits;
        match purpose {
            Purpose::InviteCampaign => session.invites_today < limits.per_account_daily,
            Purpose::DirectMessage => {
                session.messages_today < limits.per_account_daily_messages
            }
            Purpose::Parse | Purpose::AdminProbe => true,
        }
    }

    /// earliest moment at which any of the user's sessions could become
    /// eligible again; feeds the caller's back-off
    fn availability_hint(&self, sessions: &[SessionRecord], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut hint: Option<DateTime<Utc>> = None;
        let mut consider = |at: DateTime<Utc>| {
            if at > now && hint.map(|current| at < current).unwrap_or(true) {
                hint = Some(at);
            }
        };
        for session in sessions {
            match session.status {
                SessionStatus::FloodWait => {
                    if let Some(until) = session.flood_wait_until {
                        consider(until);
                    }
                }
                SessionStatus::Blocked => {
                    if let Some(until) = session.blocked_until {
                        consider(until);
                    }
                }
                SessionStatus::Active => {
                    if !session.lock_free(now) {
                        if let Some(expires) = session.lock_expires_at {
                            consider(expires);
                        }
                    } else {
                        // free but out of budget: next daily rollover
                        consider(limits::next_day_boundary(now, self.config.counters_reset_hour));
                    }
                }
                SessionStatus::Disabled => {}
            }
        }
        hint
    }

    /// selects and locks one of the user's sessions for the given purpose
    pub async fn allocate(
        &self,
        user_id: i64,
        purpose: Purpose,
        caller: &str,
    ) -> Result<AccountAllocation, AllocateError> {
        let now = self.clock.now();
        let sessions = self
            .store
            .list_sessions(user_id)
            .await
            .map_err(AllocateError::Store)?;
        if sessions.is_empty() {
            self.telemetry.incr("allocations.no_sessions");
            return Err(AllocateError::UserHasNoSessions);
        }

        let mut candidates: Vec<SessionRecord> = sessions
            .iter()
            .filter(|session| session.status == SessionStatus::Active)
            .filter(|session| session.lock_free(now))
            .map(|session| {
                let mut rolled = (*session).clone();
                rolled.roll_day(now, self.config.counters_reset_hour);
                rolled
            })
            .filter(|session| self.purpose_budget_ok(purpose, session))
            .collect();

        candidates.sort_by(|a, b| {
            self.score(a, now)
                .partial_cmp(&self.score(b, now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });

        let ttl = purpose.lock_ttl(&self.config.allocation);
        for candidate in candidates {
            let acquired = self
                .locks
                .try_acquire(&candidate.session_id, caller, ttl, now)
                .await
                .map_err(AllocateError::Store)?;
            if !acquired {
                continue;
            }

            // mirror the lock onto the session row for observability
            let updated = self
                .mutate_session(&candidate.session_id, |session| {
                    session.locked_by = Some(caller.to_string());
                    session.lock_expires_at =
                        Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
                    session.last_used_at = Some(now);
                })
                .await
                .map_err(|e| match e {
                    AccountError::Store(e) => AllocateError::Store(e),
                    AccountError::InvalidAllocation => {
                        AllocateError::Store(StoreError::NotFound)
                    }
                })?;

            let token = format!(
                "alloc_{:08x}",
                self.token_seq.fetch_add(1, Ordering::SeqCst)
            );
            {
                let mut live = self.live.lock().unwrap();
                live.insert(
                    token.clone(),
                    LiveAllocation {
                        session_id: updated.session_id.clone(),
                        caller: caller.to_string(),
                        released: false,
                        applied: HashSet::new(),
                    },
                );
            }

            self.telemetry.incr("allocations.success");
            self.telemetry.emit(
                "allocate",
                json!({
                    "account_id": updated.session_id,
                    "purpose": purpose.as_str(),
                    "caller": caller,
                    "outcome": "SUCCESS",
                }),
            );
            info!(
                "Allocated session {} to {} for {}",
                updated.session_id,
                caller,
                purpose.as_str()
            );

            return Ok(AccountAllocation {
                token,
                session_id: updated.session_id.clone(),
                owner_user_id: updated.owner_user_id,
                purpose,
                session: SessionRef {
                    session_id: updated.session_id.clone(),
                    phone: updated.phone.clone(),
                    session_blob: updated.session_blob.clone(),
                },
                invites_today: updated.invites_today,
                messages_today: updated.messages_today,
            });
        }

        self.telemetry.incr("allocations.no_account");
        let retry_after = self.availability_hint(&sessions, now);
        Err(AllocateError::NoAvailableAccount { retry_after })
    }

    /// checks the action against every applicable limit rule
    pub async fn check_limit(
        &self,
        allocation: &AccountAllocation,
        action: ActionKind,
        scope: Option<&str>,
    ) -> Result<Decision, AccountError> {
        self.require_live(&allocation.token)?;
        let now = self.clock.now();
        let mut session = self
            .store
            .get_session(&allocation.session_id)
            .await
            .map_err(AccountError::Store)?
            .ok_or(AccountError::InvalidAllocation)?;
        session.roll_day(now, self.config.counters_reset_hour);
        Ok(limits::evaluate(
            &self.config.limits,
            &session,
            action,
            scope,
            now,
            self.config.counters_reset_hour,
        ))
    }

    /// records the outcome of one dispatched action and applies the
    /// resulting state transition before returning.
    ///
    /// idempotent per (token, action, scope, outcome): replays are ignored.
    pub async fn record_action(
        &self,
        allocation: &AccountAllocation,
        action: ActionKind,
        scope: Option<&str>,
        outcome: RecordOutcome,
    ) -> Result<SessionStatus, AccountError> {
        let idempotency_key = format!(
            "{}:{}:{}:{}",
            allocation.token,
            action.as_str(),
            scope.unwrap_or("-"),
            outcome.key()
        );
        if !self.claim_key(&allocation.token, &idempotency_key)? {
            let session = self
                .store
                .get_session(&allocation.session_id)
                .await
                .map_err(AccountError::Store)?
                .ok_or(AccountError::InvalidAllocation)?;
            return Ok(session.status);
        }

        let now = self.clock.now();
        match outcome {
            RecordOutcome::Success => {
                let scope_owned = scope.map(|s| s.to_string());
                let updated = self
                    .mutate_session(&allocation.session_id, move |session| {
                        match action {
                            ActionKind::Invite => {
                                session.invites_today += 1;
                                if let Some(channel) = &scope_owned {
                                    let stats =
                                        session.per_channel.entry(channel.clone()).or_default();
                                    stats.invites_today += 1;
                                    stats.invites_lifetime += 1;
                                }
                                session.recent_invites.push(now);
                                session.last_invite_at = Some(now);
                            }
                            ActionKind::Message => session.messages_today += 1,
                            ActionKind::ContactAdd => session.contacts_today += 1,
                            ActionKind::Read => {}
                        }
                        session.last_used_at = Some(now);
                    })
                    .await?;
                if action == ActionKind::Invite {
                    self.telemetry.incr("invites.SUCCESS");
                }
                Ok(updated.status)
            }
            RecordOutcome::Failed(kind) => {
                if action == ActionKind::Invite {
                    self.telemetry.incr(&format!("invites.{}", kind.code()));
                }
                self.apply_failure(&allocation.session_id, kind, now).await
            }
        }
    }

    /// short-circuit failure path for errors observed outside a specific
    /// in-progress action; returns the session's new status
    pub async fn handle_error(
        &self,
        allocation: &AccountAllocation,
        kind: ErrorKind,
        context: &str,
    ) -> Result<SessionStatus, AccountError> {
        let idempotency_key = format!("{}:HANDLE:{}:{}", allocation.token, kind.code(), context);
        if !self.claim_key(&allocation.token, &idempotency_key)? {
            let session = self
                .store
                .get_session(&allocation.session_id)
                .await
                .map_err(AccountError::Store)?
                .ok_or(AccountError::InvalidAllocation)?;
            return Ok(session.status);
        }
        let now = self.clock.now();
        self.apply_failure(&allocation.session_id, kind, now).await
    }

    /// releases the lock and reconciles the usage report against the
    /// counters; discrepancies are logged, never rolled back. idempotent.
    pub async fn release(
        &self,
        allocation: &AccountAllocation,
        usage: UsageReport,
    ) -> Result<(), AccountError> {
        let caller = {
            let mut live = self.live.lock().unwrap();
            let entry = live
                .get_mut(&allocation.token)
                .ok_or(AccountError::InvalidAllocation)?;
            if entry.released {
                return Ok(());
            }
            entry.released = true;
            entry.caller.clone()
        };

        self.locks
            .release(&allocation.session_id, &caller)
            .await
            .map_err(AccountError::Store)?;

        let updated = self
            .mutate_session(&allocation.session_id, |session| {
                session.locked_by = None;
                session.lock_expires_at = None;
            })
            .await?;

        let recorded_invites = updated
            .invites_today
            .saturating_sub(allocation.invites_today);
        if recorded_invites != usage.invites {
            warn!(
                "Usage report mismatch for session {}: caller reported {} invite(s), counters moved {}",
                allocation.session_id, usage.invites, recorded_invites
            );
        }

        self.telemetry.emit(
            "release",
            json!({
                "account_id": allocation.session_id,
                "caller": caller,
                "invites": usage.invites,
                "messages": usage.messages,
                "channels": usage.channels,
            }),
        );
        Ok(())
    }

    /// refreshes a long-lived allocation's lock before the ttl runs out
    pub async fn extend_lock(&self, allocation: &AccountAllocation) -> Result<bool, AccountError> {
        let caller = {
            let live = self.live.lock().unwrap();
            let entry = live
                .get(&allocation.token)
                .ok_or(AccountError::InvalidAllocation)?;
            if entry.released {
                return Err(AccountError::InvalidAllocation);
            }
            entry.caller.clone()
        };
        let now = self.clock.now();
        let ttl = allocation.purpose.lock_ttl(&self.config.allocation);
        let extended = self
            .locks
            .extend(&allocation.session_id, &caller, ttl, now)
            .await
            .map_err(AccountError::Store)?;
        if extended {
            self.mutate_session(&allocation.session_id, |session| {
                session.lock_expires_at =
                    Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
            })
            .await?;
        }
        Ok(extended)
    }

    fn require_live(&self, token: &str) -> Result<(), AccountError> {
        let live = self.live.lock().unwrap();
        match live.get(token) {
            Some(entry) if !entry.released => Ok(()),
            _ => Err(AccountError::InvalidAllocation),
        }
    }

    /// claims the idempotency key; false means this exact call already ran
    fn claim_key(&self, token: &str, key: &str) -> Result<bool, AccountError> {
        let mut live = self.live.lock().unwrap();
        let entry = live.get_mut(token).ok_or(AccountError::InvalidAllocation)?;
        if entry.released {
            return Err(AccountError::InvalidAllocation);
        }
        Ok(entry.applied.insert(key.to_string()))
    }

    async fn apply_failure(
        &self,
        session_id: &str,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, AccountError> {
        let buffer = chrono::Duration::from_std(self.config.flood_wait_buffer).unwrap_or_default();
        let block = chrono::Duration::from_std(self.config.peer_flood_block).unwrap_or_default();

        let updated = self
            .mutate_session(session_id, move |session| {
                session.last_used_at = Some(now);
                // a disabled session stays disabled
                if session.status == SessionStatus::Disabled {
                    return;
                }
                match kind {
                    ErrorKind::FloodWait { seconds } => {
                        session.status = SessionStatus::FloodWait;
                        session.flood_wait_until =
                            Some(now + chrono::Duration::seconds(seconds as i64) + buffer);
                        session.error_count += 1;
                    }
                    ErrorKind::PeerFlood => {
                        session.status = SessionStatus::Blocked;
                        session.blocked_until = Some(now + block);
                        session.error_count += 1;
                    }
                    kind if kind.is_account_fatal() => {
                        session.status = SessionStatus::Disabled;
                        session.error_count += 1;
                    }
                    kind if kind.is_account_fault() => {
                        session.error_count += 1;
                    }
                    // anything else does not reflect on the account and
                    // leaves its budget untouched
                    _ => {}
                }
            })
            .await?;

        match updated.status {
            SessionStatus::FloodWait => {
                let due_at = updated.flood_wait_until.unwrap_or(now);
                self.locks
                    .schedule_recovery(&RecoveryEntry {
                        account_id: session_id.to_string(),
                        due_at,
                        reason: RecoveryReason::FloodWait,
                        failures: 0,
                    })
                    .await
                    .map_err(AccountError::Store)?;
                self.telemetry.incr("sessions.flood_wait");
                self.telemetry.emit(
                    "session_flood_wait",
                    json!({
                        "account_id": session_id,
                        "error_kind": kind.code(),
                        "until": due_at.to_rfc3339(),
                    }),
                );
            }
            SessionStatus::Blocked => {
                let due_at = updated.blocked_until.unwrap_or(now);
                self.locks
                    .schedule_recovery(&RecoveryEntry {
                        account_id: session_id.to_string(),
                        due_at,
                        reason: RecoveryReason::PeerFlood,
                        failures: 0,
                    })
                    .await
                    .map_err(AccountError::Store)?;
                self.telemetry.incr("sessions.blocked");
                self.telemetry.emit(
                    "session_flood_wait",
                    json!({
                        "account_id": session_id,
                        "error_kind": kind.code(),
                        "until": due_at.to_rfc3339(),
                    }),
                );
            }
            SessionStatus::Disabled => {
                self.locks
                    .remove_recovery(session_id)
                    .await
                    .map_err(AccountError::Store)?;
                self.telemetry.incr("sessions.disabled");
                self.telemetry.emit(
                    "session_disabled",
                    json!({
                        "account_id": session_id,
                        "error_kind": kind.code(),
                    }),
                );
            }
            _ => {}
        }

        Ok(updated.status)
    }

    /// load-mutate-store with optimistic retry; daily counters roll lazily
    /// on every write
    async fn mutate_session<F>(&self, session_id: &str, mut apply: F) -> Result<SessionRecord, AccountError>
    where
        F: FnMut(&mut SessionRecord),
    {
        for _ in 0..5 {
            let mut session = self
                .store
                .get_session(session_id)
                .await
                .map_err(AccountError::Store)?
                .ok_or(AccountError::InvalidAllocation)?;
            session.roll_day(self.clock.now(), self.config.counters_reset_hour);
            apply(&mut session);
            match self.store.update_session(&session).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(AccountError::Store(e)),
            }
        }
        Err(AccountError::Store(StoreError::Conflict))
    }
}
