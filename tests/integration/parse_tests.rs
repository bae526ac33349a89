use chrono::{TimeZone, Utc};

use tg_orchestra::broker::{EntityKind, HistoryBatch, HistoryMessage, ParticipantBatch, ParticipantInfo};
use tg_orchestra::engine::sanitize;
use tg_orchestra::error::ErrorKind;
use tg_orchestra::models::{
    ParseResultKind, SessionStatus, SourceStatus, TaskCounters, TaskStatus,
};
use tg_orchestra::store::StateStore;

use super::test_utils::TestEnv;

fn message(id: i32, text: &str) -> HistoryMessage {
    HistoryMessage {
        id,
        date: Utc.with_ymd_and_hms(2025, 6, 30, 18, 0, 0).unwrap(),
        text: text.to_string(),
        media_kind: None,
        media_bytes: None,
        reply_count: None,
    }
}

fn media_message(id: i32, bytes: Vec<u8>) -> HistoryMessage {
    HistoryMessage {
        id,
        date: Utc.with_ymd_and_hms(2025, 6, 30, 18, 0, 0).unwrap(),
        text: "photo caption".to_string(),
        media_kind: Some("photo".to_string()),
        media_bytes: Some(bytes),
        reply_count: None,
    }
}

fn participant(user_id: i64, username: &str) -> ParticipantInfo {
    ParticipantInfo {
        user_id,
        username: Some(username.to_string()),
        first_name: Some(username.to_string()),
        last_name: None,
        phone: None,
        is_bot: false,
    }
}

#[tokio::test]
async fn broadcast_channel_without_comments_is_filtered_at_planning() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;
    env.broker
        .register_community("https://t.me/silent", 500, EntityKind::Broadcast);
    env.broker.set_comments_enabled(500, false);

    let task = env.add_parse_task(1, &["https://t.me/silent"]).await;
    env.parse.run_task(&task.task_id).await.unwrap();

    // the source terminated before any fetch; the task completed empty
    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    match &task.counters {
        TaskCounters::Parse(counters) => {
            assert_eq!(counters.sources[0].status, SourceStatus::Failed);
            assert!(counters.sources[0]
                .note
                .as_deref()
                .unwrap_or_default()
                .contains("комментарии"));
        }
        _ => panic!("parse task carries parse counters"),
    }
    assert_eq!(
        env.store.count_parse_results(&task.task_id).await.unwrap(),
        0
    );
    assert_eq!(env.broker.calls_matching("fetch_history"), 0);
}

#[tokio::test]
async fn megagroup_parse_extracts_messages_media_and_participants() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;
    env.broker
        .register_community("@clubchat", 600, EntityKind::Megagroup);

    env.broker.queue_history(
        600,
        Ok(HistoryBatch {
            items: vec![
                message(11, "first"),
                message(12, "second"),
                media_message(13, vec![0xde, 0xad, 0xbe, 0xef]),
            ],
            next_offset: Some(11),
        }),
    );
    env.broker.queue_history(
        600,
        Ok(HistoryBatch {
            items: vec![message(9, "third"), message(8, "fourth")],
            next_offset: None,
        }),
    );
    env.broker.queue_participants(
        600,
        Ok(ParticipantBatch {
            items: vec![participant(201, "m1"), participant(202, "m2")],
            next_offset: None,
        }),
    );

    let task = env.add_parse_task(1, &["@clubchat"]).await;
    env.parse.run_task(&task.task_id).await.unwrap();

    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let results = env
        .store
        .parse_results_for_task(&task.task_id)
        .await
        .unwrap();
    let count_of = |kind: ParseResultKind| {
        results
            .iter()
            .filter(|result| result.kind == kind)
            .count()
    };
    assert_eq!(count_of(ParseResultKind::Community), 1);
    assert_eq!(count_of(ParseResultKind::Message), 5);
    assert_eq!(count_of(ParseResultKind::Media), 1);
    assert_eq!(count_of(ParseResultKind::Participant), 2);

    match &task.counters {
        TaskCounters::Parse(counters) => {
            assert_eq!(counters.processed_messages, 5);
            assert_eq!(counters.processed_media, 1);
            assert_eq!(counters.processed_users, 2);
            assert!(counters.progress_percent <= 100);
            assert_eq!(counters.sources[0].status, SourceStatus::Done);
        }
        _ => panic!("parse task carries parse counters"),
    }

    // every payload is json-encodable and binary fields round-trip
    for result in &results {
        serde_json::to_string(&result.payload).unwrap();
    }
    let media = results
        .iter()
        .find(|result| result.kind == ParseResultKind::Media)
        .unwrap();
    let encoded = media.payload["media_data"].as_str().unwrap();
    assert_eq!(
        sanitize::decode_binary(encoded).unwrap(),
        vec![0xde, 0xad, 0xbe, 0xef]
    );
    // dates were normalised to rfc-3339 strings
    let sample = results
        .iter()
        .find(|result| result.kind == ParseResultKind::Message)
        .unwrap();
    assert!(sample.payload["date"]
        .as_str()
        .unwrap()
        .starts_with("2025-06-30T18:00:00"));
}

#[tokio::test]
async fn flood_wait_mid_parse_switches_to_another_account() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;
    env.add_session("s-beta", 1).await;
    env.broker
        .register_community("@feedchat", 700, EntityKind::Megagroup);

    env.broker.queue_history(
        700,
        Ok(HistoryBatch {
            items: vec![message(31, "one"), message(32, "two")],
            next_offset: Some(31),
        }),
    );
    env.broker
        .queue_history(700, Err(ErrorKind::FloodWait { seconds: 120 }));
    env.broker.queue_history(
        700,
        Ok(HistoryBatch {
            items: vec![message(29, "three")],
            next_offset: None,
        }),
    );

    let task = env.add_parse_task(1, &["@feedchat"]).await;
    env.parse.run_task(&task.task_id).await.unwrap();

    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    // all three messages landed despite the account switch
    let results = env
        .store
        .parse_results_for_task(&task.task_id)
        .await
        .unwrap();
    assert_eq!(
        results
            .iter()
            .filter(|result| result.kind == ParseResultKind::Message)
            .count(),
        3
    );

    // exactly one of the two sessions is cooling down with recovery queued
    let alpha = env.session("s-alpha").await;
    let beta = env.session("s-beta").await;
    let flooded: Vec<_> = [&alpha, &beta]
        .into_iter()
        .filter(|session| session.status == SessionStatus::FloodWait)
        .collect();
    assert_eq!(flooded.len(), 1);

    // two different sessions issued history fetches
    let calls = env.broker.recorded_calls();
    let fetchers: std::collections::HashSet<&str> = calls
        .iter()
        .filter(|call| call.starts_with("fetch_history"))
        .map(|call| call.split(':').nth(1).unwrap())
        .collect();
    assert_eq!(fetchers.len(), 2);
}

#[tokio::test]
async fn deleted_source_terminates_without_failing_the_task() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;
    env.broker
        .register_community("@alive_chat", 800, EntityKind::Megagroup);
    // "@gonechannel" is never registered: resolution fails as NOT_FOUND

    env.broker.queue_history(
        800,
        Ok(HistoryBatch {
            items: vec![message(41, "still here")],
            next_offset: None,
        }),
    );

    let task = env
        .add_parse_task(1, &["@gonechannel", "@alive_chat"])
        .await;
    env.parse.run_task(&task.task_id).await.unwrap();

    let task = env.task(&task.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    match &task.counters {
        TaskCounters::Parse(counters) => {
            assert_eq!(counters.sources[0].status, SourceStatus::Failed);
            assert_eq!(counters.sources[1].status, SourceStatus::Done);
        }
        _ => panic!("parse task carries parse counters"),
    }

    // the healthy source still produced its records
    assert!(env.store.count_parse_results(&task.task_id).await.unwrap() >= 2);
}

#[tokio::test]
async fn displayed_progress_is_clamped_to_one_hundred() {
    let env = TestEnv::new();
    env.add_session("s-alpha", 1).await;
    env.broker
        .register_community("@tiny_test_chat", 900, EntityKind::Megagroup);

    // "test" handles estimate very low, so real volume overshoots
    let items: Vec<HistoryMessage> = (0..250).map(|i| message(1000 - i, "msg")).collect();
    let mut batches: Vec<HistoryBatch> = Vec::new();
    for chunk in items.chunks(50) {
        batches.push(HistoryBatch {
            items: chunk.to_vec(),
            next_offset: chunk.last().map(|item| item.id),
        });
    }
    for (index, batch) in batches.into_iter().enumerate() {
        let mut batch = batch;
        if index == 4 {
            batch.next_offset = None;
        }
        env.broker.queue_history(900, Ok(batch));
    }

    let task = env.add_parse_task(1, &["@tiny_test_chat"]).await;
    env.parse.run_task(&task.task_id).await.unwrap();

    let task = env.task(&task.task_id).await;
    match &task.counters {
        TaskCounters::Parse(counters) => {
            assert!(counters.processed() > counters.estimated_total);
            assert_eq!(counters.progress_percent, 100);
        }
        _ => panic!("parse task carries parse counters"),
    }
}
