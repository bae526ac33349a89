use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;

use crate::broker::{SessionBroker, SessionRef};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::BoxError;
use crate::models::{SessionRecord, SessionStatus};
use crate::store::{LockStore, StateStore, StoreError};
use crate::telemetry::Telemetry;

/// maintenance worker that wakes cooled-down sessions.
///
/// due entries are probed through the broker; a healthy probe returns the
/// session to rotation with its counters intact, a failing one backs off
/// exponentially until the session is eventually disabled.
pub struct RecoveryWorker {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockStore>,
    broker: Arc<dyn SessionBroker>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    telemetry: Arc<Telemetry>,
}

impl RecoveryWorker {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockStore>,
        broker: Arc<dyn SessionBroker>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            locks,
            broker,
            clock,
            config,
            telemetry,
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.recovery.poll_interval).await;
            if let Err(e) = self.tick().await {
                error!("Recovery tick failed: {}", e);
            }
        }
    }

    /// one pass over the due entries; returns how many sessions recovered
    pub async fn tick(&self) -> Result<usize, BoxError> {
        let now = self.clock.now();
        let due = self.locks.due_recoveries(now).await?;
        let mut recovered = 0;

        for entry in due {
            let session = match self.store.get_session(&entry.account_id).await? {
                Some(session) => session,
                None => {
                    // owner deleted the session while it was cooling down
                    self.locks.remove_recovery(&entry.account_id).await?;
                    continue;
                }
            };
            if session.status == SessionStatus::Disabled {
                self.locks.remove_recovery(&entry.account_id).await?;
                continue;
            }

            let session_ref = SessionRef {
                session_id: session.session_id.clone(),
                phone: session.phone.clone(),
                session_blob: session.session_blob.clone(),
            };

            match self.broker.probe_session(&session_ref).await {
                Ok(()) => {
                    self.mark_active(&session).await?;
                    self.locks.remove_recovery(&entry.account_id).await?;
                    self.telemetry.incr("sessions.recovered");
                    self.telemetry.emit(
                        "session_recovered",
                        json!({
                            "account_id": entry.account_id,
                            "reason": entry.reason.as_str(),
                        }),
                    );
                    info!("Session {} recovered", entry.account_id);
                    recovered += 1;
                }
                Err(probe_error) => {
                    let failures = entry.failures + 1;
                    if failures >= self.config.recovery.max_probe_failures {
                        warn!(
                            "Session {} failed {} probes, disabling: {}",
                            entry.account_id, failures, probe_error
                        );
                        self.mark_disabled(&session).await?;
                        self.locks.remove_recovery(&entry.account_id).await?;
                        self.telemetry.incr("sessions.disabled");
                        self.telemetry.emit(
                            "session_disabled",
                            json!({
                                "account_id": entry.account_id,
                                "error_kind": probe_error.kind.code(),
                            }),
                        );
                        continue;
                    }

                    let backoff = self.probe_backoff(failures);
                    let mut rescheduled = entry.clone();
                    rescheduled.failures = failures;
                    rescheduled.due_at =
                        now + chrono::Duration::from_std(backoff).unwrap_or_default();
                    warn!(
                        "Probe for session {} failed ({}), retrying at {}",
                        entry.account_id, probe_error, rescheduled.due_at
                    );
                    self.locks.schedule_recovery(&rescheduled).await?;
                }
            }
        }

        Ok(recovered)
    }

    /// exponential backoff capped at the configured ceiling, with jitter
    fn probe_backoff(&self, failures: u32) -> std::time::Duration {
        let recovery = &self.config.recovery;
        let shift = failures.min(16);
        let base = recovery
            .probe_backoff_base
            .saturating_mul(1u32 << shift.min(12));
        let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
        (base + std::time::Duration::from_millis(jitter_ms)).min(recovery.probe_backoff_cap)
    }

    async fn mark_active(&self, session: &SessionRecord) -> Result<(), BoxError> {
        self.mutate(session, |session| {
            session.status = SessionStatus::Active;
            session.flood_wait_until = None;
            session.blocked_until = None;
        })
        .await
    }

    async fn mark_disabled(&self, session: &SessionRecord) -> Result<(), BoxError> {
        self.mutate(session, |session| {
            session.status = SessionStatus::Disabled;
        })
        .await
    }

    async fn mutate<F>(&self, session: &SessionRecord, apply: F) -> Result<(), BoxError>
    where
        F: Fn(&mut SessionRecord),
    {
        for _ in 0..5 {
            let mut fresh = match self.store.get_session(&session.session_id).await? {
                Some(fresh) => fresh,
                None => return Ok(()),
            };
            apply(&mut fresh);
            match self.store.update_session(&fresh).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict.into())
    }
}
