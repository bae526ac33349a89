use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

use crate::account::limits::{ActionKind, Decision};
use crate::account::{
    AccountAllocation, AccountManager, AllocateError, Purpose, RecordOutcome, UsageReport,
};
use crate::broker::{EntityDescriptor, SessionBroker, TargetIdentity};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{BoxError, ClassifiedError, ErrorKind};
use crate::models::{
    generate_id, ActionOutcome, ExecutionLogRecord, InviteCounters, InviteSettings, InviteType,
    TargetRecord, TargetStatus, TaskCounters, TaskRecord, TaskSettings, TaskStatus,
};
use crate::store::{StateStore, StoreError};
use crate::telemetry::Telemetry;

use super::retry_delay;

/// result of one dispatch step
#[derive(Debug)]
pub enum DispatchOutcome {
    /// the target reached a terminal status
    Dispatched { target_id: String },
    /// the target went back to the head of the queue (account cooled down)
    Requeued { target_id: String },
    /// no account can serve the task right now
    Paused {
        retry_after: Option<DateTime<Utc>>,
    },
    Completed,
    /// the task is no longer running (owner pause/cancel or systemic failure)
    Stopped,
}

/// per-task dispatch state: the resolved group and which accounts passed or
/// failed admin verification. exclusions are per-task, never global.
pub struct InviteContext {
    task_id: String,
    owner_user_id: i64,
    settings: InviteSettings,
    group_entity: Option<EntityDescriptor>,
    verified_accounts: HashSet<String>,
    excluded_accounts: HashSet<String>,
}

/// campaign scheduler: walks the pending targets of one invite task and
/// dispatches them under the account manager's verdicts
pub struct InviteEngine {
    store: Arc<dyn StateStore>,
    accounts: Arc<AccountManager>,
    broker: Arc<dyn SessionBroker>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    telemetry: Arc<Telemetry>,
}

impl InviteEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        accounts: Arc<AccountManager>,
        broker: Arc<dyn SessionBroker>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            accounts,
            broker,
            clock,
            config,
            telemetry,
        }
    }

    pub fn context(&self, task: &TaskRecord) -> Result<InviteContext, BoxError> {
        let settings = match &task.settings {
            TaskSettings::Invite(settings) => settings.clone(),
            TaskSettings::Parse(_) => return Err("not an invite task".into()),
        };
        Ok(InviteContext {
            task_id: task.task_id.clone(),
            owner_user_id: task.owner_user_id,
            settings,
            group_entity: None,
            verified_accounts: HashSet::new(),
            excluded_accounts: HashSet::new(),
        })
    }

    /// drives the task to a terminal or parked state
    pub async fn run_task(&self, task_id: &str) -> Result<(), BoxError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or("invite task not found")?;
        if task.status == TaskStatus::Pending {
            self.set_status(task_id, TaskStatus::Running, None, None).await?;
        }

        // resuming re-verifies admin rights: the context starts empty
        let mut context = self.context(&task)?;

        loop {
            match self.dispatch_next(&mut context).await? {
                DispatchOutcome::Dispatched { .. } | DispatchOutcome::Requeued { .. } => continue,
                DispatchOutcome::Paused {
                    retry_after: Some(at),
                } => {
                    let now = self.clock.now();
                    if at > now {
                        let wait = (at - now).to_std().unwrap_or_default();
                        info!(
                            "Invite task {} waiting {}s for an eligible account",
                            task_id,
                            wait.as_secs()
                        );
                        sleep(wait).await;
                    }
                    self.resume(task_id).await?;
                    continue;
                }
                DispatchOutcome::Paused { retry_after: None } => return Ok(()),
                DispatchOutcome::Completed | DispatchOutcome::Stopped => return Ok(()),
            }
        }
    }

    /// puts a system-paused task back into rotation
    pub async fn resume(&self, task_id: &str) -> Result<(), BoxError> {
        self.set_status(task_id, TaskStatus::Running, None, None).await
    }

    /// one dispatch step: pick the head target, obtain a verified account
    /// that passes every limit, perform the platform call, classify, record
    pub async fn dispatch_next(
        &self,
        context: &mut InviteContext,
    ) -> Result<DispatchOutcome, BoxError> {
        let task = self
            .store
            .get_task(&context.task_id)
            .await?
            .ok_or("invite task disappeared")?;
        if task.status != TaskStatus::Running {
            return Ok(DispatchOutcome::Stopped);
        }

        let target = match self.store.next_pending_target(&context.task_id).await? {
            Some(target) => target,
            None => {
                self.complete(&context.task_id).await?;
                return Ok(DispatchOutcome::Completed);
            }
        };

        // identifier-less targets fail without a platform call or an account
        if !target.has_identifier() {
            self.finish_target(
                context,
                &target,
                TargetStatus::Failed,
                Some(ErrorKind::InvalidIdentifier),
                None,
                ActionOutcome::Failed,
                ErrorKind::InvalidIdentifier.human_message(),
                0,
            )
            .await?;
            return Ok(DispatchOutcome::Dispatched {
                target_id: target.target_id,
            });
        }

        let allocation = match self.acquire_account(context).await? {
            Acquired::Ready(allocation) => allocation,
            Acquired::Paused {
                retry_after,
                reason,
            } => {
                self.pause(&context.task_id, &reason, retry_after).await?;
                return Ok(DispatchOutcome::Paused { retry_after });
            }
            Acquired::TaskFailed(reason) => {
                self.set_status(
                    &context.task_id,
                    TaskStatus::Failed,
                    Some(reason),
                    None,
                )
                .await?;
                return Ok(DispatchOutcome::Stopped);
            }
        };

        self.dispatch_target(context, target, allocation).await
    }

    async fn dispatch_target(
        &self,
        context: &mut InviteContext,
        mut target: TargetRecord,
        allocation: AccountAllocation,
    ) -> Result<DispatchOutcome, BoxError> {
        let scope = self.scope_key(context);
        let action = self.action_kind(context);
        let identity = TargetIdentity::from(&target);

        target.attempts += 1;
        target.last_account_id = Some(allocation.session_id.clone());
        target.updated_at = self.clock.now();
        self.store.update_target(&target).await?;

        let started = Instant::now();
        let mut attempt = 0u32;
        let result = loop {
            let call = match context.settings.invite_type {
                InviteType::GroupInvite => {
                    let group = context
                        .group_entity
                        .as_ref()
                        .ok_or("group entity not resolved")?;
                    self.broker
                        .send_invite(&allocation.session, group, &identity)
                        .await
                }
                InviteType::DirectMessage => {
                    let text = context
                        .settings
                        .message_text
                        .as_deref()
                        .unwrap_or_default();
                    self.broker
                        .send_direct_message(&allocation.session, &identity, text)
                        .await
                }
            };
            match call {
                Err(e)
                    if e.kind == ErrorKind::TransientNetwork
                        && attempt < self.config.transient_retry_cap =>
                {
                    let delay = retry_delay(attempt);
                    warn!(
                        "Transient error for target {} (attempt {}): {}. Retrying in {}ms",
                        target.describe(),
                        attempt + 1,
                        e,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                other => break other,
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                self.accounts
                    .record_action(&allocation, action, scope.as_deref(), RecordOutcome::Success)
                    .await?;
                self.finish_target(
                    context,
                    &target,
                    TargetStatus::Invited,
                    None,
                    Some(&allocation.session_id),
                    ActionOutcome::Success,
                    success_message(context.settings.invite_type),
                    duration_ms,
                )
                .await?;
                self.release(&allocation, usage_for_success(action, &scope))
                    .await?;
                DispatchOutcome::Dispatched {
                    target_id: target.target_id.clone(),
                }
            }
            Err(error) => {
                self.handle_dispatch_error(
                    context,
                    &target,
                    &allocation,
                    action,
                    scope.as_deref(),
                    error,
                    duration_ms,
                )
                .await?
            }
        };

        self.telemetry.emit(
            "invite_attempt",
            json!({
                "task_id": context.task_id,
                "account_id": allocation.session_id,
                "target": target.describe(),
                "duration_ms": duration_ms,
            }),
        );

        Ok(outcome)
    }

    /// routes a classified failure exactly as the outcome matrix prescribes
    async fn handle_dispatch_error(
        &self,
        context: &mut InviteContext,
        target: &TargetRecord,
        allocation: &AccountAllocation,
        action: ActionKind,
        scope: Option<&str>,
        error: ClassifiedError,
        duration_ms: u64,
    ) -> Result<DispatchOutcome, BoxError> {
        let kind = error.kind;
        let account_id = allocation.session_id.clone();

        match kind {
            ErrorKind::AlreadyParticipant => {
                // terminal for the target, success-equivalent when opted in
                self.accounts
                    .record_action(allocation, action, scope, RecordOutcome::Failed(kind))
                    .await?;
                self.finish_target(
                    context,
                    target,
                    TargetStatus::Skipped,
                    Some(kind),
                    Some(&account_id),
                    ActionOutcome::Skipped,
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Dispatched {
                    target_id: target.target_id.clone(),
                })
            }
            kind if kind.is_target_terminal() => {
                // the account is not at fault and keeps its budget
                self.accounts
                    .record_action(allocation, action, scope, RecordOutcome::Failed(kind))
                    .await?;
                self.finish_target(
                    context,
                    target,
                    TargetStatus::Failed,
                    Some(kind),
                    Some(&account_id),
                    ActionOutcome::Failed,
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Dispatched {
                    target_id: target.target_id.clone(),
                })
            }
            ErrorKind::FloodWait { .. } | ErrorKind::PeerFlood => {
                // the account cools down; the target rejoins at the head
                self.accounts
                    .handle_error(allocation, kind, "invite dispatch")
                    .await?;
                self.store.requeue_target_front(&target.target_id).await?;
                self.append_log(
                    context,
                    Some(target),
                    Some(&account_id),
                    action,
                    ActionOutcome::Skipped,
                    Some(kind),
                    format!("{} — цель возвращена в очередь", error.message),
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Requeued {
                    target_id: target.target_id.clone(),
                })
            }
            kind if kind.is_account_fatal() => {
                // session is gone for good; the target is not at fault
                self.accounts
                    .handle_error(allocation, kind, "invite dispatch")
                    .await?;
                self.store.requeue_target_front(&target.target_id).await?;
                self.append_log(
                    context,
                    Some(target),
                    Some(&account_id),
                    action,
                    ActionOutcome::SystemError,
                    Some(kind),
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Requeued {
                    target_id: target.target_id.clone(),
                })
            }
            ErrorKind::GroupRestriction => {
                // the group itself refuses invites: a task-level decision
                self.accounts
                    .record_action(allocation, action, scope, RecordOutcome::Failed(kind))
                    .await?;
                self.append_log(
                    context,
                    Some(target),
                    Some(&account_id),
                    action,
                    ActionOutcome::Failed,
                    Some(kind),
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                self.pause(&context.task_id, "group forbids invites", None)
                    .await?;
                Ok(DispatchOutcome::Paused { retry_after: None })
            }
            ErrorKind::TransientNetwork => {
                // retries are exhausted at this point
                self.accounts
                    .record_action(allocation, action, scope, RecordOutcome::Failed(kind))
                    .await?;
                self.finish_target(
                    context,
                    target,
                    TargetStatus::Failed,
                    Some(kind),
                    Some(&account_id),
                    ActionOutcome::SystemError,
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Dispatched {
                    target_id: target.target_id.clone(),
                })
            }
            _ => {
                self.accounts
                    .record_action(
                        allocation,
                        action,
                        scope,
                        RecordOutcome::Failed(ErrorKind::UnknownPlatformError),
                    )
                    .await?;
                self.finish_target(
                    context,
                    target,
                    TargetStatus::Failed,
                    Some(ErrorKind::UnknownPlatformError),
                    Some(&account_id),
                    ActionOutcome::Failed,
                    error.message,
                    duration_ms,
                )
                .await?;
                self.release(allocation, UsageReport::default()).await?;
                Ok(DispatchOutcome::Dispatched {
                    target_id: target.target_id.clone(),
                })
            }
        }
    }

    /// allocates an account that passes admin verification and every limit
    /// rule; pauses when nothing is eligible.
    ///
    /// rejected-but-healthy candidates stay locked until the round ends so
    /// the allocator keeps moving down the candidate list instead of handing
    /// the same account back.
    async fn acquire_account(&self, context: &mut InviteContext) -> Result<Acquired, BoxError> {
        let caller = format!("invite-engine:{}", context.task_id);
        let scope = self.scope_key(context);
        let action = self.action_kind(context);
        let mut held: Vec<AccountAllocation> = Vec::new();
        let mut earliest_retry: Option<DateTime<Utc>> = None;
        let mut last_deny_rule: Option<&'static str> = None;

        let acquired = loop {
            let allocation = match self
                .accounts
                .allocate(context.owner_user_id, Purpose::InviteCampaign, &caller)
                .await
            {
                Ok(allocation) => allocation,
                Err(AllocateError::UserHasNoSessions) => {
                    break Acquired::TaskFailed("owner has no sessions".to_string())
                }
                Err(AllocateError::NoAvailableAccount { retry_after }) => {
                    let retry_after = merge_retry(earliest_retry, retry_after);
                    let reason = match last_deny_rule {
                        Some(rule) => format!("limit exhausted: {}", rule),
                        None => "no eligible account".to_string(),
                    };
                    break Acquired::Paused {
                        retry_after,
                        reason,
                    };
                }
                Err(AllocateError::Store(e)) => {
                    for rejected in held {
                        self.release(&rejected, UsageReport::default()).await?;
                    }
                    return Err(e.into());
                }
            };

            if context.excluded_accounts.contains(&allocation.session_id) {
                held.push(allocation);
                continue;
            }

            if context.settings.invite_type == InviteType::GroupInvite {
                match self.verify_account(context, &allocation).await? {
                    Verification::Passed => {}
                    Verification::Excluded => {
                        held.push(allocation);
                        continue;
                    }
                    Verification::AccountUnavailable => {
                        // the session just left rotation; freeing the lock is
                        // safe, its status blocks re-allocation
                        self.release(&allocation, UsageReport::default()).await?;
                        continue;
                    }
                    Verification::TaskFailed(reason) => {
                        self.release(&allocation, UsageReport::default()).await?;
                        break Acquired::TaskFailed(reason);
                    }
                }
            }

            match self
                .accounts
                .check_limit(&allocation, action, scope.as_deref())
                .await?
            {
                Decision::Allow => break Acquired::Ready(allocation),
                Decision::Deny { rule, retry_after } => {
                    info!(
                        "Account {} denied for task {} by {}",
                        allocation.session_id,
                        context.task_id,
                        rule.as_str()
                    );
                    earliest_retry = merge_retry(earliest_retry, retry_after);
                    last_deny_rule = Some(rule.as_str());
                    held.push(allocation);
                    continue;
                }
            }
        };

        for rejected in held {
            self.release(&rejected, UsageReport::default()).await?;
        }
        Ok(acquired)
    }

    /// admin verification for group invites; failures exclude the account
    /// from this task only
    async fn verify_account(
        &self,
        context: &mut InviteContext,
        allocation: &AccountAllocation,
    ) -> Result<Verification, BoxError> {
        if context.verified_accounts.contains(&allocation.session_id) {
            return Ok(Verification::Passed);
        }

        if context.group_entity.is_none() {
            let group_id = match &context.settings.group_id {
                Some(group_id) => group_id.clone(),
                None => return Ok(Verification::TaskFailed("no group configured".to_string())),
            };
            match self
                .broker
                .resolve_entity(&allocation.session, &group_id)
                .await
            {
                Ok(entity) => context.group_entity = Some(entity),
                Err(e) if e.kind.is_account_recoverable() || e.kind.is_account_fatal() => {
                    self.accounts
                        .handle_error(allocation, e.kind, "group resolution")
                        .await?;
                    return Ok(Verification::AccountUnavailable);
                }
                Err(e) => {
                    return Ok(Verification::TaskFailed(format!(
                        "group unresolvable: {}",
                        e
                    )))
                }
            }
        }

        let group = context.group_entity.as_ref().unwrap();
        let required = vec!["invite_users".to_string()];
        match self
            .broker
            .verify_admin_rights(&allocation.session, group, &required)
            .await
        {
            Ok(rights) if rights.has_required => {
                context
                    .verified_accounts
                    .insert(allocation.session_id.clone());
                Ok(Verification::Passed)
            }
            Ok(_) => {
                info!(
                    "Account {} lacks invite rights in {}, excluding for task {}",
                    allocation.session_id, group.title, context.task_id
                );
                context
                    .excluded_accounts
                    .insert(allocation.session_id.clone());
                Ok(Verification::Excluded)
            }
            Err(e) if e.kind.is_account_recoverable() || e.kind.is_account_fatal() => {
                self.accounts
                    .handle_error(allocation, e.kind, "admin verification")
                    .await?;
                Ok(Verification::AccountUnavailable)
            }
            Err(_) => {
                context
                    .excluded_accounts
                    .insert(allocation.session_id.clone());
                Ok(Verification::Excluded)
            }
        }
    }

    fn scope_key(&self, context: &InviteContext) -> Option<String> {
        match context.settings.invite_type {
            InviteType::GroupInvite => context.settings.group_id.clone(),
            InviteType::DirectMessage => None,
        }
    }

    fn action_kind(&self, context: &InviteContext) -> ActionKind {
        match context.settings.invite_type {
            InviteType::GroupInvite => ActionKind::Invite,
            InviteType::DirectMessage => ActionKind::Message,
        }
    }

    async fn release(
        &self,
        allocation: &AccountAllocation,
        usage: UsageReport,
    ) -> Result<(), BoxError> {
        self.accounts.release(allocation, usage).await?;
        Ok(())
    }

    /// marks a target terminal, logs the operation and refreshes counters
    #[allow(clippy::too_many_arguments)]
    async fn finish_target(
        &self,
        context: &InviteContext,
        target: &TargetRecord,
        status: TargetStatus,
        error_kind: Option<ErrorKind>,
        account_id: Option<&str>,
        outcome: ActionOutcome,
        message: String,
        duration_ms: u64,
    ) -> Result<(), BoxError> {
        let mut updated = target.clone();
        updated.status = status;
        updated.last_error_kind = error_kind.map(|kind| kind.code().to_string());
        if let Some(account_id) = account_id {
            updated.last_account_id = Some(account_id.to_string());
        }
        updated.updated_at = self.clock.now();
        self.store.update_target(&updated).await?;

        self.append_log(
            context,
            Some(target),
            account_id,
            self.action_kind(context),
            outcome,
            error_kind,
            message,
            duration_ms,
        )
        .await?;

        self.refresh_counters(context).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_log(
        &self,
        context: &InviteContext,
        target: Option<&TargetRecord>,
        account_id: Option<&str>,
        action: ActionKind,
        outcome: ActionOutcome,
        error_kind: Option<ErrorKind>,
        message: String,
        duration_ms: u64,
    ) -> Result<(), BoxError> {
        self.store
            .append_log(&ExecutionLogRecord {
                log_id: generate_id("log"),
                task_id: context.task_id.clone(),
                target_id: target.map(|target| target.target_id.clone()),
                account_id: account_id.map(|id| id.to_string()),
                action: action.as_str().to_string(),
                outcome,
                error_kind: error_kind.map(|kind| kind.code().to_string()),
                message,
                duration_ms,
                created_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }

    /// recomputes the task's {completed, failed, pending} counters from the
    /// target table
    async fn refresh_counters(&self, context: &InviteContext) -> Result<(), BoxError> {
        let invited = self
            .store
            .count_targets(&context.task_id, TargetStatus::Invited)
            .await?;
        let skipped = self
            .store
            .count_targets(&context.task_id, TargetStatus::Skipped)
            .await?;
        let failed = self
            .store
            .count_targets(&context.task_id, TargetStatus::Failed)
            .await?;
        let pending = self
            .store
            .count_targets(&context.task_id, TargetStatus::Pending)
            .await?;

        let (completed, failed) = if context.settings.already_participant_is_success {
            (invited + skipped, failed)
        } else {
            (invited, failed + skipped)
        };

        self.mutate_task(&context.task_id, |task| {
            task.counters = TaskCounters::Invite(InviteCounters {
                completed,
                failed,
                pending,
            });
        })
        .await
    }

    async fn complete(&self, task_id: &str) -> Result<(), BoxError> {
        self.mutate_task(task_id, |task| {
            task.status = TaskStatus::Completed;
            task.pause_reason = None;
            task.resume_at = None;
        })
        .await?;
        self.telemetry.emit("task_completed", json!({ "task_id": task_id }));
        info!("Invite task {} completed", task_id);
        Ok(())
    }

    async fn pause(
        &self,
        task_id: &str,
        reason: &str,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<(), BoxError> {
        self.set_status(task_id, TaskStatus::Paused, Some(reason.to_string()), resume_at)
            .await
    }

    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<String>,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<(), BoxError> {
        self.mutate_task(task_id, |task| {
            task.status = status;
            task.pause_reason = reason.clone();
            task.resume_at = resume_at;
        })
        .await
    }

    async fn mutate_task<F>(&self, task_id: &str, apply: F) -> Result<(), BoxError>
    where
        F: Fn(&mut TaskRecord),
    {
        for _ in 0..5 {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("task disappeared")?;
            apply(&mut task);
            task.updated_at = self.clock.now();
            match self.store.update_task(&task).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict.into())
    }
}

enum Acquired {
    Ready(AccountAllocation),
    Paused {
        retry_after: Option<DateTime<Utc>>,
        reason: String,
    },
    TaskFailed(String),
}

enum Verification {
    Passed,
    Excluded,
    AccountUnavailable,
    TaskFailed(String),
}

fn merge_retry(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn usage_for_success(action: ActionKind, scope: &Option<String>) -> UsageReport {
    let mut usage = UsageReport::default();
    match action {
        ActionKind::Invite => usage.invites = 1,
        ActionKind::Message => usage.messages = 1,
        ActionKind::ContactAdd => usage.contacts = 1,
        ActionKind::Read => {}
    }
    if let Some(channel) = scope {
        usage.channels.push(channel.clone());
    }
    usage
}

fn success_message(invite_type: InviteType) -> String {
    match invite_type {
        InviteType::GroupInvite => "пользователь приглашён в группу".to_string(),
        InviteType::DirectMessage => "сообщение доставлено".to_string(),
    }
}

