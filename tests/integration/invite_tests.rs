use chrono::Duration;

use tg_orchestra::broker::EntityKind;
use tg_orchestra::engine::invite::DispatchOutcome;
use tg_orchestra::error::ErrorKind;
use tg_orchestra::models::{ActionOutcome, SessionStatus, TargetStatus, TaskStatus};
use tg_orchestra::store::{LockStore, StateStore};

use super::test_utils::TestEnv;

const GROUP: &str = "@club";
const GROUP_ID: i64 = 100;

async fn setup_group(env: &TestEnv) {
    env.broker
        .register_community(GROUP, GROUP_ID, EntityKind::Megagroup);
}

/// drives the dispatch loop like the production worker: waits out every
/// timed pause by advancing the manual clock
async fn drive_to_completion(env: &TestEnv, task_id: &str) {
    let task = env.task(task_id).await;
    let mut context = env.invite.context(&task).unwrap();
    let mut guard = 0;
    loop {
        guard += 1;
        assert!(guard < 100, "dispatch loop did not converge");
        match env.invite.dispatch_next(&mut context).await.unwrap() {
            DispatchOutcome::Completed => return,
            DispatchOutcome::Dispatched { .. } | DispatchOutcome::Requeued { .. } => continue,
            DispatchOutcome::Paused {
                retry_after: Some(at),
            } => {
                env.clock.set(at + Duration::seconds(1));
                env.invite.resume(task_id).await.unwrap();
            }
            DispatchOutcome::Paused { retry_after: None } => {
                panic!("task paused indefinitely")
            }
            DispatchOutcome::Stopped => panic!("task stopped unexpectedly"),
        }
    }
}

#[tokio::test]
async fn campaign_with_one_account_and_three_targets() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    let task = env
        .add_invite_task(1, GROUP, &["alice", "bob", "carol"])
        .await;
    drive_to_completion(&env, &task.task_id).await;

    // all targets invited, task completed
    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Invited)
            .await,
        3
    );
    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    // counters moved exactly three times, all through the account manager
    let session = env.session("s-alpha").await;
    assert_eq!(session.invites_today, 3);
    let stats = session.channel_stats(GROUP);
    assert_eq!(stats.invites_today, 3);
    assert_eq!(stats.invites_lifetime, 3);
    assert_eq!(session.status, SessionStatus::Active);

    // the session lock is gone after the final release
    assert!(session.locked_by.is_none());

    // exactly one SUCCESS log per invited target
    let logs = env.store.logs_for_task(&task.task_id).await.unwrap();
    let successes: Vec<_> = logs
        .iter()
        .filter(|entry| entry.outcome == ActionOutcome::Success && entry.action == "INVITE")
        .collect();
    assert_eq!(successes.len(), 3);

    // cooldown honored: no two successful invites within 15 minutes
    let mut times: Vec<_> = successes.iter().map(|entry| entry.created_at).collect();
    times.sort();
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::minutes(15));
    }
}

#[tokio::test]
async fn flood_wait_switches_account_and_requeues_target_at_head() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.add_session("s-beta", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);
    env.broker.grant_invite_rights("s-beta", GROUP_ID);

    // the second target's first attempt hits a one-hour flood wait
    env.broker
        .queue_invite_result("bob", Err(ErrorKind::FloodWait { seconds: 3600 }));

    let task = env.add_invite_task(1, GROUP, &["alice", "bob"]).await;
    drive_to_completion(&env, &task.task_id).await;

    // both targets delivered despite the flood
    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Invited)
            .await,
        2
    );

    // exactly one session is cooling down, with a scheduled recovery
    let alpha = env.session("s-alpha").await;
    let beta = env.session("s-beta").await;
    let flooded = [&alpha, &beta]
        .into_iter()
        .filter(|session| session.status == SessionStatus::FloodWait)
        .count();
    assert_eq!(flooded, 1);
    let flooded_session = if alpha.status == SessionStatus::FloodWait {
        &alpha
    } else {
        &beta
    };
    let due = env
        .locks
        .due_recoveries(flooded_session.flood_wait_until.unwrap() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(due
        .iter()
        .any(|entry| entry.account_id == flooded_session.session_id));

    // the flood-wait buffer is applied on top of the reported seconds
    assert!(
        flooded_session.flood_wait_until.unwrap()
            >= super::test_utils::start_time() + Duration::seconds(3600 + 60)
    );

    // no duplicate success log for the requeued target: exactly one SUCCESS
    // row per delivered invite
    let logs = env.store.logs_for_task(&task.task_id).await.unwrap();
    let successes = logs
        .iter()
        .filter(|entry| entry.outcome == ActionOutcome::Success && entry.action == "INVITE")
        .count();
    assert_eq!(successes, 2);
}

#[tokio::test]
async fn lifetime_exhaustion_pauses_without_platform_call() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    // the account has burned its 200 lifetime invites into this channel
    let mut session = env.session("s-alpha").await;
    session
        .per_channel
        .entry(GROUP.to_string())
        .or_default()
        .invites_lifetime = 200;
    env.store.update_session(&session).await.unwrap();

    let task = env.add_invite_task(1, GROUP, &["dave", "erin"]).await;
    let mut context = env.invite.context(&env.task(&task.task_id).await).unwrap();

    let outcome = env.invite.dispatch_next(&mut context).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Paused { .. }));

    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Paused);
    assert!(task
        .pause_reason
        .as_deref()
        .unwrap_or_default()
        .contains("per_channel_lifetime"));

    // no invite ever reached the platform
    assert_eq!(env.broker.calls_matching("send_invite"), 0);
    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Pending)
            .await,
        2
    );
}

#[tokio::test]
async fn non_admin_account_is_excluded_for_the_task_only() {
    let env = TestEnv::new();
    setup_group(&env).await;
    // "s-a" sorts first and is tried first, but lacks invite rights
    env.add_session("s-a", 1).await;
    env.add_session("s-b", 1).await;
    env.broker.grant_invite_rights("s-b", GROUP_ID);

    let task = env.add_invite_task(1, GROUP, &["frank"]).await;
    drive_to_completion(&env, &task.task_id).await;

    // the admin account carried the invite
    let frank = env
        .store
        .next_pending_target(&task.task_id)
        .await
        .unwrap();
    assert!(frank.is_none());
    let logs = env.store.logs_for_task(&task.task_id).await.unwrap();
    let success = logs
        .iter()
        .find(|entry| entry.outcome == ActionOutcome::Success)
        .expect("one successful dispatch");
    assert_eq!(success.account_id.as_deref(), Some("s-b"));

    // both candidates were verified against the group
    assert!(env.broker.calls_matching("verify_admin:s-a:") >= 1);
    assert!(env.broker.calls_matching("verify_admin:s-b:") >= 1);

    // exclusion is per-task: the non-admin session is untouched globally
    let excluded = env.session("s-a").await;
    assert_eq!(excluded.status, SessionStatus::Active);
    assert_eq!(excluded.invites_today, 0);
}

#[tokio::test]
async fn cooldown_spaces_four_invites_on_one_account() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    let task = env
        .add_invite_task(1, GROUP, &["t1", "t2", "t3", "t4"])
        .await;
    drive_to_completion(&env, &task.task_id).await;

    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Invited)
            .await,
        4
    );

    let session = env.session("s-alpha").await;
    let mut invites = session.recent_invites.clone();
    invites.sort();
    assert_eq!(invites.len(), 4);
    for pair in invites.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::minutes(15),
            "two successful invites within the cooldown window"
        );
    }
}

#[tokio::test]
async fn target_terminal_errors_do_not_consume_the_budget() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    env.broker
        .queue_invite_result("ghost", Err(ErrorKind::UserNotFound));
    env.broker
        .queue_invite_result("hermit", Err(ErrorKind::PrivacyRestricted));
    env.broker
        .queue_invite_result("busy", Err(ErrorKind::TargetChannelLimit));

    let task = env
        .add_invite_task(1, GROUP, &["ghost", "hermit", "busy"])
        .await;
    drive_to_completion(&env, &task.task_id).await;

    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Failed)
            .await,
        3
    );

    // the account paid nothing for failures that were not its fault
    let session = env.session("s-alpha").await;
    assert_eq!(session.invites_today, 0);
    assert_eq!(session.channel_stats(GROUP).invites_lifetime, 0);
    assert_eq!(session.status, SessionStatus::Active);

    // every failure carries its human-readable reason in the log
    let logs = env.store.logs_for_task(&task.task_id).await.unwrap();
    assert!(logs
        .iter()
        .any(|entry| entry.error_kind.as_deref() == Some("USER_NOT_FOUND")));
    assert!(logs
        .iter()
        .any(|entry| entry.message.contains("приватности")));
}

#[tokio::test]
async fn already_participant_counts_as_success_equivalent_when_opted_in() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    env.broker
        .queue_invite_result("insider", Err(ErrorKind::AlreadyParticipant));

    let task = env.add_invite_task(1, GROUP, &["insider"]).await;
    drive_to_completion(&env, &task.task_id).await;

    assert_eq!(
        env.targets_with_status(&task.task_id, TargetStatus::Skipped)
            .await,
        1
    );
    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    match &task.counters {
        tg_orchestra::models::TaskCounters::Invite(counters) => {
            assert_eq!(counters.completed, 1);
            assert_eq!(counters.failed, 0);
        }
        _ => panic!("invite task carries invite counters"),
    }
}

#[tokio::test]
async fn identifierless_target_fails_without_any_platform_call() {
    let env = TestEnv::new();
    setup_group(&env).await;
    env.add_session("s-alpha", 1).await;
    env.broker.grant_invite_rights("s-alpha", GROUP_ID);

    let task = env.add_invite_task(1, GROUP, &[]).await;
    // a target that lost its identifiers (validated at import normally)
    let mut broken = tg_orchestra::models::TargetRecord {
        target_id: "tgt_broken".to_string(),
        task_id: task.task_id.clone(),
        username: None,
        phone: None,
        platform_user_id: None,
        display_name: Some("Nobody".to_string()),
        status: TargetStatus::Pending,
        attempts: 0,
        last_error_kind: None,
        last_account_id: None,
        position: 1,
        updated_at: env.now(),
    };
    env.store
        .insert_targets(&[broken.clone()])
        .await
        .unwrap();

    drive_to_completion(&env, &task.task_id).await;

    broken = env
        .store
        .get_target("tgt_broken")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broken.status, TargetStatus::Failed);
    assert_eq!(broken.last_error_kind.as_deref(), Some("INVALID_IDENTIFIER"));
    assert_eq!(env.broker.calls_matching("send_invite"), 0);
    assert_eq!(env.broker.calls_matching("resolve"), 0);
}
