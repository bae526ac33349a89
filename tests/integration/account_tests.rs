use chrono::Duration;

use tg_orchestra::account::limits::{ActionKind, Decision, LimitRule};
use tg_orchestra::account::{AllocateError, Purpose, RecordOutcome, UsageReport};
use tg_orchestra::error::ErrorKind;
use tg_orchestra::models::SessionStatus;
use tg_orchestra::store::{LockStore, StateStore};

use super::test_utils::TestEnv;

#[tokio::test]
async fn a_session_is_never_held_by_two_allocations() {
    let env = TestEnv::new();
    env.add_session("s-only", 1).await;

    let first = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine-a")
        .await
        .unwrap();
    assert_eq!(first.session_id, "s-only");

    // the second caller loses the race
    let second = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine-b")
        .await;
    assert!(matches!(
        second,
        Err(AllocateError::NoAvailableAccount { .. })
    ));

    // the lock store names the holder
    let holder = env.locks.holder("s-only", env.now()).await.unwrap();
    assert_eq!(holder.as_deref(), Some("engine-a"));

    // after release the session is allocatable again
    env.accounts
        .release(&first, UsageReport::default())
        .await
        .unwrap();
    let session = env.session("s-only").await;
    assert!(session.locked_by.is_none());
    env.accounts
        .allocate(1, Purpose::InviteCampaign, "engine-b")
        .await
        .unwrap();
}

#[tokio::test]
async fn allocation_for_a_user_without_sessions_fails_distinctly() {
    let env = TestEnv::new();
    let result = env.accounts.allocate(42, Purpose::Parse, "parse").await;
    assert!(matches!(result, Err(AllocateError::UserHasNoSessions)));
}

#[tokio::test]
async fn record_action_is_idempotent_per_allocation() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();

    for _ in 0..5 {
        env.accounts
            .record_action(
                &allocation,
                ActionKind::Invite,
                Some("@club"),
                RecordOutcome::Success,
            )
            .await
            .unwrap();
    }

    // counters advanced exactly once
    let session = env.session("s-alpha").await;
    assert_eq!(session.invites_today, 1);
    assert_eq!(session.channel_stats("@club").invites_lifetime, 1);
    assert_eq!(session.recent_invites.len(), 1);
}

#[tokio::test]
async fn release_is_idempotent() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    env.accounts
        .release(&allocation, UsageReport::default())
        .await
        .unwrap();
    // second and later calls ack without effect
    env.accounts
        .release(&allocation, UsageReport::default())
        .await
        .unwrap();

    let session = env.session("s-alpha").await;
    assert!(session.locked_by.is_none());
    assert!(session.lock_free(env.now()));
}

#[tokio::test]
async fn flood_wait_blocks_allocation_until_recovery_probe_succeeds() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    let status = env
        .accounts
        .handle_error(&allocation, ErrorKind::FloodWait { seconds: 60 }, "test")
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::FloodWait);
    env.accounts
        .release(&allocation, UsageReport::default())
        .await
        .unwrap();

    // flood_wait_until = now + seconds + 60s buffer
    let session = env.session("s-alpha").await;
    let expected_until = env.now() + Duration::seconds(60 + 60);
    assert_eq!(session.flood_wait_until, Some(expected_until));

    // while cooling down the account cannot be allocated
    let denied = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await;
    match denied {
        Err(AllocateError::NoAvailableAccount { retry_after }) => {
            assert_eq!(retry_after, Some(expected_until));
        }
        other => panic!("expected NoAvailableAccount, got {:?}", other.map(|_| ())),
    }

    // once due, the recovery probe returns the session to rotation
    env.clock.set(expected_until + Duration::seconds(1));
    let recovered = env.recovery.tick().await.unwrap();
    assert_eq!(recovered, 1);
    let session = env.session("s-alpha").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert!(env.locks.due_recoveries(env.now() + Duration::days(2)).await.unwrap().is_empty());

    env.accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_probes_back_off_and_eventually_disable_the_session() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    env.accounts
        .handle_error(&allocation, ErrorKind::PeerFlood, "test")
        .await
        .unwrap();
    env.accounts
        .release(&allocation, UsageReport::default())
        .await
        .unwrap();

    let session = env.session("s-alpha").await;
    assert_eq!(session.status, SessionStatus::Blocked);

    // every probe fails; back-off grows until the session is disabled
    for _ in 0..env.config.recovery.max_probe_failures {
        env.broker
            .queue_probe_result("s-alpha", Err(ErrorKind::TransientNetwork));
    }
    for _ in 0..env.config.recovery.max_probe_failures {
        env.clock.advance(Duration::hours(25));
        env.recovery.tick().await.unwrap();
    }

    let session = env.session("s-alpha").await;
    assert_eq!(session.status, SessionStatus::Disabled);
    assert!(env
        .locks
        .due_recoveries(env.now() + Duration::days(30))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn fatal_error_disables_terminally() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    let status = env
        .accounts
        .handle_error(&allocation, ErrorKind::PhoneBanned, "test")
        .await
        .unwrap();
    assert_eq!(status, SessionStatus::Disabled);

    // disabled sessions never come back through recovery
    env.clock.advance(Duration::days(2));
    assert_eq!(env.recovery.tick().await.unwrap(), 0);
    assert_eq!(env.session("s-alpha").await.status, SessionStatus::Disabled);
}

#[tokio::test]
async fn daily_budget_resets_at_the_utc_boundary() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    // exhaust the daily invite budget
    let mut session = env.session("s-alpha").await;
    session.counters_day = tg_orchestra::models::SessionRecord::effective_day(env.now(), 0);
    session.invites_today = env.config.limits.per_account_daily;
    env.store.update_session(&session).await.unwrap();

    let denied = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await;
    assert!(matches!(
        denied,
        Err(AllocateError::NoAvailableAccount { .. })
    ));

    // next utc day the same session serves again
    env.clock.advance(Duration::hours(24));
    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    let decision = env
        .accounts
        .check_limit(&allocation, ActionKind::Invite, Some("@club"))
        .await
        .unwrap();
    assert!(decision.is_allow());
}

#[tokio::test]
async fn per_channel_daily_boundary_allows_15_denies_16() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let mut session = env.session("s-alpha").await;
    session.counters_day = tg_orchestra::models::SessionRecord::effective_day(env.now(), 0);
    session.invites_today = 14;
    session.per_channel.insert(
        "@club".to_string(),
        tg_orchestra::models::ChannelStats {
            invites_today: 14,
            invites_lifetime: 14,
        },
    );
    env.store.update_session(&session).await.unwrap();

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();

    // 15th of the day into this channel: allowed
    let decision = env
        .accounts
        .check_limit(&allocation, ActionKind::Invite, Some("@club"))
        .await
        .unwrap();
    assert!(decision.is_allow());
    env.accounts
        .record_action(
            &allocation,
            ActionKind::Invite,
            Some("@club"),
            RecordOutcome::Success,
        )
        .await
        .unwrap();

    // 16th: denied until the next utc day
    let decision = env
        .accounts
        .check_limit(&allocation, ActionKind::Invite, Some("@club"))
        .await
        .unwrap();
    match decision {
        Decision::Deny { rule, retry_after } => {
            assert_eq!(rule, LimitRule::PerChannelDaily);
            assert!(retry_after.unwrap() > env.now());
        }
        Decision::Allow => panic!("16th same-day channel invite must be denied"),
    }
}

#[tokio::test]
async fn lock_ttl_expiry_frees_a_vanished_caller() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "crashed-engine")
        .await
        .unwrap();
    // the caller disappears without releasing; counters were never touched
    drop(allocation);

    let ttl = env.config.allocation.invite_lock_ttl;
    env.clock
        .advance(Duration::from_std(ttl).unwrap() + Duration::seconds(1));

    // the ttl has lapsed: a new caller allocates without corruption
    let second = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "fresh-engine")
        .await
        .unwrap();
    assert_eq!(second.session_id, "s-alpha");
    let session = env.session("s-alpha").await;
    assert_eq!(session.invites_today, 0);
}

#[tokio::test]
async fn usage_report_discrepancies_are_logged_not_rolled_back() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;

    let allocation = env
        .accounts
        .allocate(1, Purpose::InviteCampaign, "engine")
        .await
        .unwrap();
    env.accounts
        .record_action(
            &allocation,
            ActionKind::Invite,
            Some("@club"),
            RecordOutcome::Success,
        )
        .await
        .unwrap();

    // the caller under-reports; release succeeds and counters stand
    let mut usage = UsageReport::default();
    usage.invites = 0;
    env.accounts.release(&allocation, usage).await.unwrap();

    let session = env.session("s-alpha").await;
    assert_eq!(session.invites_today, 1);
}
