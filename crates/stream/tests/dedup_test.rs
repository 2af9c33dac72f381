//! Deduplicating producer tests.
//!
//! Covers:
//! - Same (producer, publishing id) stored exactly once
//! - Resume after restart from the last confirmed publishing id
//! - Resume after a crash with only part of a batch confirmed

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use rill_stream::{
    ConfirmationCode, ConfirmationTracker, Environment, InMemoryBroker, Offset, ProducerConfig,
    PublishingId, Record, StreamBroker, StreamOptions,
};

async fn environment_with_stream(stream: &str) -> (Environment, Arc<InMemoryBroker>) {
    let broker = InMemoryBroker::new_arc();
    let env = Environment::new(broker.clone());
    env.create_stream(stream, StreamOptions::default())
        .await
        .unwrap();
    (env, broker)
}

async fn publish_range(env: &Environment, stream: &str, name: &str, ids: std::ops::Range<u64>) {
    let producer = env
        .producer(ProducerConfig::new(stream).with_name(name))
        .await
        .unwrap();
    let count = ids.end.saturating_sub(ids.start);
    let tracker = Arc::new(ConfirmationTracker::expecting(count));
    for id in ids {
        producer
            .send(
                Record::new(format!("message {id}")).with_publishing_id(id),
                tracker.callback(),
            )
            .unwrap();
    }
    assert!(tracker.await_all(Duration::from_secs(5)).await);
    assert_eq!(tracker.failed_count(), 0);
    producer.close().await.unwrap();
}

async fn read_all(broker: &InMemoryBroker, stream: &str) -> Vec<(Offset, String)> {
    broker
        .read(stream, 0, usize::MAX)
        .await
        .unwrap()
        .into_iter()
        .map(|d| (d.offset, d.record.body_str().unwrap_or_default().to_string()))
        .collect()
}

// ==========================================================================
// Dedup idempotence
// ==========================================================================

#[tokio::test]
async fn should_store_resubmitted_record_once() {
    let (env, broker) = environment_with_stream("s").await;
    let producer = env
        .producer(ProducerConfig::new("s").with_name("app-1"))
        .await
        .unwrap();

    let first = producer
        .send_with_confirm(Record::new("message 0").with_publishing_id(0))
        .await
        .unwrap();
    let second = producer
        .send_with_confirm(Record::new("message 0").with_publishing_id(0))
        .await
        .unwrap();
    producer.close().await.unwrap();

    assert_eq!(first.code(), ConfirmationCode::Ok);
    assert_eq!(second.code(), ConfirmationCode::Deduplicated);
    assert!(second.is_confirmed());
    assert_eq!(read_all(&broker, "s").await, vec![(0, "message 0".to_string())]);
}

#[tokio::test]
async fn should_deduplicate_across_sessions_with_same_name() {
    let (env, broker) = environment_with_stream("s").await;

    publish_range(&env, "s", "app-1", 0..5).await;
    publish_range(&env, "s", "app-1", 0..5).await;

    assert_eq!(read_all(&broker, "s").await.len(), 5);
}

#[tokio::test]
async fn should_not_deduplicate_across_different_names() {
    let (env, broker) = environment_with_stream("s").await;

    publish_range(&env, "s", "app-1", 0..3).await;
    publish_range(&env, "s", "app-2", 0..3).await;

    assert_eq!(read_all(&broker, "s").await.len(), 6);
}

// ==========================================================================
// Resume correctness
// ==========================================================================

#[tokio::test]
async fn should_resume_after_last_publishing_id() {
    let (env, broker) = environment_with_stream("s").await;
    publish_range(&env, "s", "app-1", 0..10).await;

    let producer = env
        .producer(ProducerConfig::new("s").with_name("app-1"))
        .await
        .unwrap();
    assert_eq!(producer.last_publishing_id().await.unwrap(), 9);
    let start = producer.resume_point().await.unwrap();
    assert_eq!(start, 10);
    producer.close().await.unwrap();

    publish_range(&env, "s", "app-1", start..20).await;

    let records = read_all(&broker, "s").await;
    let expected: Vec<(Offset, String)> = (0..20).map(|i| (i, format!("message {i}"))).collect();
    assert_eq!(records, expected);
}

#[tokio::test]
async fn should_fill_gap_after_partial_confirmation() {
    let (env, broker) = environment_with_stream("s").await;
    let total: PublishingId = 12;

    // First session only gets the first 7 records through.
    publish_range(&env, "s", "app-1", 0..7).await;

    // Restarted session resends the whole batch from the resume point onward.
    let producer = env
        .producer(ProducerConfig::new("s").with_name("app-1"))
        .await
        .unwrap();
    let start = producer.resume_point().await.unwrap();
    producer.close().await.unwrap();
    assert_eq!(start, 7);
    publish_range(&env, "s", "app-1", start..total).await;

    let bodies: Vec<String> = read_all(&broker, "s").await.into_iter().map(|(_, b)| b).collect();
    let expected: Vec<String> = (0..total).map(|i| format!("message {i}")).collect();
    assert_eq!(bodies, expected, "No duplicates and no gaps");
}

#[tokio::test]
async fn should_drop_overlap_when_resending_from_zero() {
    let (env, broker) = environment_with_stream("s").await;
    publish_range(&env, "s", "app-1", 0..7).await;

    // A restarted session that ignores the resume point still produces no duplicates.
    publish_range(&env, "s", "app-1", 0..12).await;

    assert_eq!(read_all(&broker, "s").await.len(), 12);
}

#[tokio::test]
async fn should_append_records_without_id_even_when_named() {
    let (env, broker) = environment_with_stream("s").await;
    let producer = env
        .producer(ProducerConfig::new("s").with_name("app-1"))
        .await
        .unwrap();

    for _ in 0..3 {
        let status = producer
            .send_with_confirm(Record::new("no id"))
            .await
            .unwrap();
        assert_eq!(status.code(), ConfirmationCode::Ok);
    }
    producer.close().await.unwrap();

    assert_eq!(read_all(&broker, "s").await.len(), 3);
}
