use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::time::sleep;

use crate::account::{AccountAllocation, AccountManager, AllocateError, Purpose, UsageReport};
use crate::broker::{normalize_handle, EntityDescriptor, EntityKind, SessionBroker};
use crate::clock::Clock;
use crate::config::{OrchestratorConfig, SpeedProfile};
use crate::error::{BoxError, ErrorKind};
use crate::models::{
    generate_id, ParseCounters, ParseResultKind, ParseResultRecord, SourceProgress, SourceStatus,
    TaskCounters, TaskRecord, TaskSettings, TaskStatus,
};
use crate::store::{StateStore, StoreError};
use crate::telemetry::Telemetry;

use super::{retry_delay, sanitize};

/// extend the parse lock after this many fetched batches
const LOCK_EXTEND_BATCHES: u32 = 10;

#[derive(Debug, PartialEq, Eq)]
enum SourceRun {
    Done,
    Failed,
    /// waiting for an account to come back; the task re-arms later
    Suspended,
    /// the task left RUNNING under us (owner pause or cancel)
    Interrupted,
}

/// how a classified broker failure routes during source execution
enum FailureRoute {
    Reallocate,
    SourceTerminal,
    Suspend,
}

fn route_failure(kind: ErrorKind) -> FailureRoute {
    match kind {
        ErrorKind::FloodWait { .. } | ErrorKind::PeerFlood => FailureRoute::Reallocate,
        kind if kind.is_account_fatal() => FailureRoute::Reallocate,
        // the source itself is gone: deleted channel, revoked access
        ErrorKind::UserNotFound
        | ErrorKind::InvalidIdentifier
        | ErrorKind::GroupRestriction
        | ErrorKind::PrivacyRestricted => FailureRoute::SourceTerminal,
        _ => FailureRoute::Suspend,
    }
}

/// crawl scheduler: plans a parse task's sources, pulls history batches
/// under the speed profile and persists the extracted records
pub struct ParseEngine {
    store: Arc<dyn StateStore>,
    accounts: Arc<AccountManager>,
    broker: Arc<dyn SessionBroker>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    telemetry: Arc<Telemetry>,
}

impl ParseEngine {
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

    pub async fn run_task(&self, task_id: &str) -> Result<(), BoxError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or("parse task not found")?;
        if task.status == TaskStatus::Pending {
            self.set_status(task_id, TaskStatus::Running, None, None).await?;
        }

        self.plan(task_id).await?;

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or("parse task disappeared")?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        let source_count = match &task.counters {
            TaskCounters::Parse(counters) => counters.sources.len(),
            TaskCounters::Invite(_) => return Err("not a parse task".into()),
        };

        let mut any_suspended = false;
        for index in 0..source_count {
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("parse task disappeared")?;
            if task.status != TaskStatus::Running {
                return Ok(());
            }
            let status = match &task.counters {
                TaskCounters::Parse(counters) => counters.sources[index].status,
                TaskCounters::Invite(_) => unreachable!(),
            };
            if matches!(
                status,
                SourceStatus::Planned | SourceStatus::Running | SourceStatus::Suspended
            ) {
                match self.run_source(&task, index).await? {
                    SourceRun::Suspended => any_suspended = true,
                    SourceRun::Interrupted => return Ok(()),
                    SourceRun::Done | SourceRun::Failed => {}
                }
            }
        }

        if any_suspended {
            // re-arm once the recovery loop has had a chance to wake accounts
            let resume_at = self.clock.now()
                + chrono::Duration::from_std(self.config.recovery.poll_interval * 4)
                    .unwrap_or_default();
            self.set_status(
                task_id,
                TaskStatus::Paused,
                Some("awaiting account recovery".to_string()),
                Some(resume_at),
            )
            .await?;
            return Ok(());
        }

        self.update_counters(task_id, |counters| counters.refresh_progress())
            .await?;
        self.set_status(task_id, TaskStatus::Completed, None, None).await?;
        self.telemetry.emit("task_completed", json!({ "task_id": task_id }));
        info!("Parse task {} completed", task_id);
        Ok(())
    }

    /// resolves every source link, applies the mandatory comments filter for
    /// broadcast channels and estimates volumes. idempotent: a planned task
    /// keeps its source list across resumes.
    pub async fn plan(&self, task_id: &str) -> Result<(), BoxError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or("parse task not found")?;
        let settings = match &task.settings {
            TaskSettings::Parse(settings) => settings.clone(),
            TaskSettings::Invite(_) => return Err("not a parse task".into()),
        };
        let already_planned = match &task.counters {
            TaskCounters::Parse(counters) => !counters.sources.is_empty(),
            TaskCounters::Invite(_) => return Err("not a parse task".into()),
        };
        if already_planned {
            return Ok(());
        }

        let caller = format!("parse-engine:{}", task_id);
        let allocation = match self
            .accounts
            .allocate(task.owner_user_id, Purpose::AdminProbe, &caller)
            .await
        {
            Ok(allocation) => allocation,
            Err(AllocateError::UserHasNoSessions) => {
                self.set_status(
                    task_id,
                    TaskStatus::Failed,
                    Some("owner has no sessions".to_string()),
                    None,
                )
                .await?;
                return Ok(());
            }
            Err(AllocateError::NoAvailableAccount { retry_after }) => {
                self.set_status(
                    task_id,
                    TaskStatus::Paused,
                    Some("no account available for planning".to_string()),
                    retry_after,
                )
                .await?;
                return Ok(());
            }
            Err(AllocateError::Store(e)) => return Err(e.into()),
        };

        let mut sources = Vec::with_capacity(settings.sources.len());
        let mut estimated_total = 0u64;
        for link in &settings.sources {
            let progress = self.plan_source(&task, &allocation, link).await?;
            estimated_total += progress.estimated;
            sources.push(progress);
        }

        self.accounts.release(&allocation, UsageReport::default()).await?;

        self.update_counters(task_id, move |counters| {
            counters.sources = sources.clone();
            counters.estimated_total = estimated_total;
            counters.refresh_progress();
        })
        .await?;
        info!(
            "Planned parse task {}: {} source(s), ~{} records estimated",
            task_id,
            settings.sources.len(),
            estimated_total
        );
        Ok(())
    }

    async fn plan_source(
        &self,
        task: &TaskRecord,
        allocation: &AccountAllocation,
        link: &str,
    ) -> Result<SourceProgress, BoxError> {
        let failed = |note: String| SourceProgress {
            link: link.to_string(),
            status: SourceStatus::Failed,
            last_offset: None,
            results: 0,
            estimated: 0,
            note: Some(note),
        };

        let handle = match normalize_handle(link) {
            Some(handle) => handle,
            None => return Ok(failed("ссылка не распознана".to_string())),
        };

        let entity = match self
            .broker
            .resolve_entity(&allocation.session, &handle)
            .await
        {
            Ok(entity) => entity,
            Err(e) if e.kind.is_account_recoverable() => {
                // resolution is retried with the execution allocation
                return Ok(SourceProgress {
                    link: link.to_string(),
                    status: SourceStatus::Planned,
                    last_offset: None,
                    results: 0,
                    estimated: estimate_volume(&handle),
                    note: None,
                });
            }
            Err(e) => return Ok(failed(e.message)),
        };

        if !entity.kind.is_community() {
            return Ok(failed("источник не является каналом или группой".to_string()));
        }

        // a broadcast channel without comments cannot yield comment-derived
        // users; it never reaches execution
        if entity.kind == EntityKind::Broadcast {
            let enabled = self
                .broker
                .check_comments_enabled(&allocation.session, &entity)
                .await
                .unwrap_or(false);
            if !enabled {
                info!(
                    "Source {} filtered out: comments disabled",
                    entity.title
                );
                return Ok(failed("комментарии в канале отключены".to_string()));
            }
        }

        self.store
            .insert_parse_results(&[ParseResultRecord {
                result_id: generate_id("res"),
                task_id: task.task_id.clone(),
                kind: ParseResultKind::Community,
                platform_key: entity.platform_id.to_string(),
                payload: sanitize::community_payload(link, &entity),
                discovered_at: self.clock.now(),
            }])
            .await?;

        Ok(SourceProgress {
            link: link.to_string(),
            status: SourceStatus::Planned,
            last_offset: None,
            results: 0,
            estimated: estimate_volume(&handle),
            note: None,
        })
    }

    /// crawls one source to completion, switching accounts on cool-downs
    async fn run_source(&self, task: &TaskRecord, index: usize) -> Result<SourceRun, BoxError> {
        let task_id = task.task_id.clone();
        let settings = match &task.settings {
            TaskSettings::Parse(settings) => settings.clone(),
            TaskSettings::Invite(_) => return Err("not a parse task".into()),
        };
        let profile = settings.speed;
        let link = match &task.counters {
            TaskCounters::Parse(counters) => counters.sources[index].link.clone(),
            TaskCounters::Invite(_) => return Err("not a parse task".into()),
        };
        let handle = match normalize_handle(&link) {
            Some(handle) => handle,
            None => {
                self.fail_source(&task_id, index, "ссылка не распознана").await?;
                return Ok(SourceRun::Failed);
            }
        };
        let caller = format!("parse-engine:{}", task_id);

        'allocation: loop {
            let allocation = match self
                .accounts
                .allocate(task.owner_user_id, Purpose::Parse, &caller)
                .await
            {
                Ok(allocation) => allocation,
                Err(AllocateError::NoAvailableAccount { .. }) => {
                    self.suspend_source(&task_id, index).await?;
                    return Ok(SourceRun::Suspended);
                }
                Err(AllocateError::UserHasNoSessions) => {
                    self.fail_source(&task_id, index, "владелец без сессий").await?;
                    return Ok(SourceRun::Failed);
                }
                Err(AllocateError::Store(e)) => return Err(e.into()),
            };

            let entity = match self
                .broker
                .resolve_entity(&allocation.session, &handle)
                .await
            {
                Ok(entity) => entity,
                Err(e) => match route_failure(e.kind) {
                    FailureRoute::Reallocate => {
                        self.accounts
                            .handle_error(&allocation, e.kind, "source resolution")
                            .await?;
                        self.accounts
                            .release(&allocation, UsageReport::default())
                            .await?;
                        continue 'allocation;
                    }
                    _ => {
                        self.fail_source(&task_id, index, &e.message).await?;
                        self.accounts
                            .release(&allocation, UsageReport::default())
                            .await?;
                        return Ok(SourceRun::Failed);
                    }
                },
            };

            self.update_counters(&task_id, |counters| {
                counters.sources[index].status = SourceStatus::Running;
            })
            .await?;

            match self
                .crawl_with_allocation(&task_id, index, &allocation, &entity, profile, &link)
                .await?
            {
                CrawlResult::Finished => {
                    self.update_counters(&task_id, |counters| {
                        counters.sources[index].status = SourceStatus::Done;
                        counters.refresh_progress();
                    })
                    .await?;
                    self.accounts
                        .release(&allocation, UsageReport::default())
                        .await?;
                    return Ok(SourceRun::Done);
                }
                CrawlResult::Interrupted => {
                    self.accounts
                        .release(&allocation, UsageReport::default())
                        .await?;
                    return Ok(SourceRun::Interrupted);
                }
                CrawlResult::SourceGone(note) => {
                    self.fail_source(&task_id, index, &note).await?;
                    self.accounts
                        .release(&allocation, UsageReport::default())
                        .await?;
                    return Ok(SourceRun::Failed);
                }
                CrawlResult::AccountLost(kind) => {
                    // cool-down or fatal error: release and pull a different
                    // account; the current offset is already persisted
                    self.accounts
                        .handle_error(&allocation, kind, "history fetch")
                        .await?;
                    self.accounts
                        .release(&allocation, UsageReport::default())
                        .await?;
                    continue 'allocation;
                }
                CrawlResult::Stalled => {
                    self.suspend_source(&task_id, index).await?;
                    self.accounts
                        .release(&allocation, UsageReport::default())
                        .await?;
                    return Ok(SourceRun::Suspended);
                }
            }
        }
    }

    /// fetches history (and participants for conversational communities)
    /// with one allocation until the source finishes or the account is lost
    async fn crawl_with_allocation(
        &self,
        task_id: &str,
        index: usize,
        allocation: &AccountAllocation,
        entity: &EntityDescriptor,
        profile: SpeedProfile,
        link: &str,
    ) -> Result<CrawlResult, BoxError> {
        let mut offset = {
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("parse task disappeared")?;
            match &task.counters {
                TaskCounters::Parse(counters) => counters.sources[index].last_offset,
                TaskCounters::Invite(_) => None,
            }
        };
        let mut batches = 0u32;
        let mut transient_attempts = 0u32;

        loop {
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("parse task disappeared")?;
            if task.status != TaskStatus::Running {
                return Ok(CrawlResult::Interrupted);
            }

            let started = std::time::Instant::now();
            match self
                .broker
                .fetch_history(&allocation.session, entity, profile, offset)
                .await
            {
                Ok(batch) => {
                    transient_attempts = 0;
                    let fetched = batch.items.len();
                    let mut records = Vec::with_capacity(fetched * 2);
                    let mut messages = 0u64;
                    let mut media = 0u64;
                    let now = self.clock.now();
                    for item in &batch.items {
                        records.push(ParseResultRecord {
                            result_id: generate_id("res"),
                            task_id: task_id.to_string(),
                            kind: ParseResultKind::Message,
                            platform_key: format!("{}:{}", entity.platform_id, item.id),
                            payload: sanitize::message_payload(link, item),
                            discovered_at: now,
                        });
                        messages += 1;
                        if item.media_kind.is_some() {
                            records.push(ParseResultRecord {
                                result_id: generate_id("res"),
                                task_id: task_id.to_string(),
                                kind: ParseResultKind::Media,
                                platform_key: format!("{}:{}:media", entity.platform_id, item.id),
                                payload: sanitize::media_payload(link, item),
                                discovered_at: now,
                            });
                            media += 1;
                        }
                    }
                    self.store.insert_parse_results(&records).await?;

                    let next_offset = batch.next_offset;
                    self.update_counters(task_id, move |counters| {
                        counters.processed_messages += messages;
                        counters.processed_media += media;
                        counters.sources[index].last_offset = next_offset;
                        counters.sources[index].results += messages + media;
                        counters.refresh_progress();
                    })
                    .await?;

                    self.telemetry
                        .incr(&format!("parse_batches.{}", profile.name()));
                    self.telemetry.emit(
                        "parse_batch",
                        json!({
                            "task_id": task_id,
                            "account_id": allocation.session_id,
                            "profile": profile.name(),
                            "items": fetched,
                            "duration_ms": started.elapsed().as_millis() as u64,
                        }),
                    );

                    offset = next_offset;
                    if offset.is_none() || fetched == 0 {
                        break;
                    }

                    sleep(profile.effective_message_delay()).await;
                    batches += 1;
                    if batches % LOCK_EXTEND_BATCHES == 0 {
                        self.accounts.extend_lock(allocation).await?;
                    }
                }
                Err(e) => match route_failure(e.kind) {
                    FailureRoute::Reallocate => return Ok(CrawlResult::AccountLost(e.kind)),
                    FailureRoute::SourceTerminal => {
                        return Ok(CrawlResult::SourceGone(e.message))
                    }
                    FailureRoute::Suspend => {
                        if transient_attempts < self.config.transient_retry_cap {
                            let delay = retry_delay(transient_attempts);
                            warn!(
                                "Fetch failed for {} ({}), retrying in {}ms",
                                link,
                                e,
                                delay.as_millis()
                            );
                            sleep(delay).await;
                            transient_attempts += 1;
                            continue;
                        }
                        return Ok(CrawlResult::Stalled);
                    }
                },
            }
        }

        // participants only exist as a member list in conversational
        // communities; broadcast audiences come from the comment threads
        // already captured with the messages
        if matches!(entity.kind, EntityKind::Group | EntityKind::Megagroup) {
            let mut participant_offset = 0usize;
            loop {
                let task = self
                    .store
                    .get_task(task_id)
                    .await?
                    .ok_or("parse task disappeared")?;
                if task.status != TaskStatus::Running {
                    return Ok(CrawlResult::Interrupted);
                }

                match self
                    .broker
                    .fetch_participants(&allocation.session, entity, profile, participant_offset)
                    .await
                {
                    Ok(batch) => {
                        let now = self.clock.now();
                        let records: Vec<ParseResultRecord> = batch
                            .items
                            .iter()
                            .map(|participant| ParseResultRecord {
                                result_id: generate_id("res"),
                                task_id: task_id.to_string(),
                                kind: ParseResultKind::Participant,
                                platform_key: format!(
                                    "{}:user:{}",
                                    entity.platform_id, participant.user_id
                                ),
                                payload: sanitize::participant_payload(link, participant),
                                discovered_at: now,
                            })
                            .collect();
                        let count = records.len() as u64;
                        self.store.insert_parse_results(&records).await?;
                        self.update_counters(task_id, move |counters| {
                            counters.processed_users += count;
                            counters.sources[index].results += count;
                            counters.refresh_progress();
                        })
                        .await?;

                        match batch.next_offset {
                            Some(next) => {
                                participant_offset = next;
                                sleep(profile.settings().user_request_delay).await;
                            }
                            None => break,
                        }
                    }
                    Err(e) => match route_failure(e.kind) {
                        FailureRoute::Reallocate => {
                            return Ok(CrawlResult::AccountLost(e.kind))
                        }
                        _ => {
                            // membership is a best-effort supplement; the
                            // messages are already persisted
                            warn!("Participant fetch failed for {}: {}", link, e);
                            break;
                        }
                    },
                }
            }
        }

        Ok(CrawlResult::Finished)
    }

    async fn fail_source(&self, task_id: &str, index: usize, note: &str) -> Result<(), BoxError> {
        let note = note.to_string();
        self.update_counters(task_id, move |counters| {
            counters.sources[index].status = SourceStatus::Failed;
            counters.sources[index].note = Some(note.clone());
        })
        .await
    }

    async fn suspend_source(&self, task_id: &str, index: usize) -> Result<(), BoxError> {
        self.update_counters(task_id, |counters| {
            counters.sources[index].status = SourceStatus::Suspended;
        })
        .await
    }

    async fn update_counters<F>(&self, task_id: &str, apply: F) -> Result<(), BoxError>
    where
        F: Fn(&mut ParseCounters),
    {
        for _ in 0..5 {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("parse task disappeared")?;
            match &mut task.counters {
                TaskCounters::Parse(counters) => apply(counters),
                TaskCounters::Invite(_) => return Err("not a parse task".into()),
            }
            task.updated_at = self.clock.now();
            match self.store.update_task(&task).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict.into())
    }

    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<String>,
        resume_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), BoxError> {
        for _ in 0..5 {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or("parse task disappeared")?;
            task.status = status;
            task.pause_reason = reason.clone();
            task.resume_at = resume_at;
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

enum CrawlResult {
    Finished,
    Interrupted,
    SourceGone(String),
    AccountLost(ErrorKind),
    Stalled,
}

/// bounded volume estimate from the handle's shape; feeds progress display
/// only, never correctness
pub fn estimate_volume(handle: &str) -> u64 {
    let name = handle.trim_start_matches('@').to_lowercase();
    let mut estimate: u64 = 2000;
    if name.len() <= 8 {
        // short handles were registered early and tend to be large
        estimate *= 2;
    }
    if name.contains("news") {
        estimate *= 3;
    }
    if name.contains("chat") {
        estimate *= 2;
    }
    if name.contains("test") {
        estimate = 200;
    }
    estimate.clamp(100, 100_000)
}
