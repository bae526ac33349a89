use log::{error, info};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::BoxError;
use crate::models::{TaskKind, TaskStatus};
use crate::store::{StateStore, StoreError};

pub mod invite;
pub mod parse;
pub mod sanitize;

pub use self::invite::InviteEngine;
pub use self::parse::ParseEngine;

const BASE_RETRY_DELAY_MS: u64 = 1000;

/// exponential backoff for transient platform errors: 1s, 2s, 4s plus up to
/// 25% jitter
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    let base = BASE_RETRY_DELAY_MS * (1 << attempt.min(10));
    let jitter = fastrand::u64(0..=base / 4);
    Duration::from_millis(base + jitter)
}

/// picks up dispatchable tasks and runs one worker per task.
///
/// ordering is priority-major with fifo inside a band; system-paused tasks
/// re-arm once their `resume_at` passes.
pub struct EngineDispatcher {
    store: Arc<dyn StateStore>,
    invite: Arc<InviteEngine>,
    parse: Arc<ParseEngine>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    running: Mutex<HashSet<String>>,
}

impl EngineDispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        invite: Arc<InviteEngine>,
        parse: Arc<ParseEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            invite,
            parse,
            clock,
            poll_interval: Duration::from_secs(5),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Task dispatcher started");
        loop {
            if let Err(e) = self.tick().await {
                error!("Dispatcher tick failed: {}", e);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// one scheduling pass: re-arm due paused tasks, then start workers for
    /// every dispatchable task
    pub async fn tick(self: &Arc<Self>) -> Result<(), BoxError> {
        let now = self.clock.now();
        for task in self.store.due_resumable_tasks(now).await? {
            let mut resumed = task.clone();
            resumed.status = TaskStatus::Pending;
            resumed.pause_reason = None;
            resumed.resume_at = None;
            resumed.updated_at = now;
            match self.store.update_task(&resumed).await {
                Ok(_) => info!("Re-armed paused task {}", task.task_id),
                Err(StoreError::Conflict) => {} // owner got there first
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(task) = self.store.next_pending_task().await? {
            {
                let running = self.running.lock().unwrap();
                if running.contains(&task.task_id) {
                    break;
                }
            }

            // claim before spawning so the next poll skips it
            let mut claimed = task.clone();
            claimed.status = TaskStatus::Running;
            claimed.updated_at = now;
            match self.store.update_task(&claimed).await {
                Ok(_) => {}
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }

            self.running
                .lock()
                .unwrap()
                .insert(task.task_id.clone());

            let dispatcher = self.clone();
            let task_id = task.task_id.clone();
            let kind = task.kind;
            info!("Starting {} task {}", kind.as_str(), task_id);
            tokio::spawn(async move {
                let result = match kind {
                    TaskKind::Invite => dispatcher.invite.run_task(&task_id).await,
                    TaskKind::Parse => dispatcher.parse.run_task(&task_id).await,
                };
                if let Err(e) = result {
                    error!("Task {} worker failed: {}", task_id, e);
                }
                dispatcher.running.lock().unwrap().remove(&task_id);
            });
        }

        Ok(())
    }
}
