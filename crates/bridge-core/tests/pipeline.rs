//! Pipeline scenarios: offline resilience, duplicate suppression, and the
//! bounded-queue overflow path, driven through the processor and queue the
//! way the agent drives them.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use bridge_core::crypto::EncryptionKey;
use bridge_core::deadletter::DeadLetterLog;
use bridge_core::event::{EventType, RawHardwareEvent};
use bridge_core::processor::{EventProcessor, ProcessOutcome};
use bridge_core::queue::DurableQueue;
use bridge_storage::MemoryEventStore;

async fn pipeline(dir: &tempfile::TempDir, queue_max: u64) -> (Arc<DurableQueue>, EventProcessor) {
    let queue = Arc::new(
        DurableQueue::open(
            Arc::new(MemoryEventStore::new()),
            Arc::new(DeadLetterLog::new(dir.path().join("deadletter.jsonl"))),
            EncryptionKey::generate(),
            queue_max,
            Duration::from_secs(300),
            10,
        )
        .await
        .unwrap(),
    );
    let processor = EventProcessor::new(Arc::clone(&queue), "dev_x".to_owned(), 300);
    (queue, processor)
}

fn raw(user: &str, secs: i64) -> RawHardwareEvent {
    RawHardwareEvent {
        external_user_id: user.to_owned(),
        timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        event_type: EventType::Entry,
        raw_data: serde_json::Map::new(),
        adapter_name: "zkteco".to_owned(),
    }
}

#[tokio::test]
async fn offline_backlog_drains_when_the_cloud_returns() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir, 10_000).await;
    let base = Utc::now().timestamp();

    // Cloud unreachable: 500 events from distinct members pile up locally.
    for i in 0..500 {
        let outcome = processor.process(raw(&format!("u{i}"), base - i)).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Queued(_)));
    }
    assert_eq!(queue.stats().await.unwrap().pending, 500);

    // Cloud returns: drain in normal-tier batches, acking each.
    let mut delivered = 0usize;
    loop {
        let batch = queue.lease_batch(50, usize::MAX).await.unwrap();
        if batch.is_empty() {
            break;
        }
        delivered += batch.len();
        let ids: Vec<u64> = batch.iter().map(|o| o.queue_id).collect();
        queue.ack_sent(&ids).await.unwrap();
    }

    assert_eq!(delivered, 500);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.sent, 500);
}

#[tokio::test]
async fn two_reads_of_the_same_card_within_the_window_are_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir, 10_000).await;
    let base = Utc::now().timestamp();

    let first = processor.process(raw("u1", base)).await.unwrap();
    let second = processor.process(raw("u1", base + 10)).await.unwrap();

    assert!(matches!(first, ProcessOutcome::Queued(_)));
    assert_eq!(second, ProcessOutcome::Duplicate);
    assert_eq!(processor.counters().duplicates, 1);
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn overflow_keeps_the_newest_and_dead_letters_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir, 10).await;
    let base = Utc::now().timestamp();

    for i in 0..15 {
        processor.process(raw(&format!("u{i}"), base - i)).await.unwrap();
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 10);
    assert_eq!(queue.counters().evicted, 5);

    let dead = DeadLetterLog::new(dir.path().join("deadletter.jsonl"));
    let lines = dead.tail(100).await.unwrap();
    assert_eq!(lines.len(), 5);
    // The oldest admissions went first.
    assert_eq!(lines[0].external_user_id, "u0");

    // The retained ten survive a drain once the cloud is back.
    let batch = queue.lease_batch(100, usize::MAX).await.unwrap();
    assert_eq!(batch.len(), 10);
    let retained: Vec<&str> = batch.iter().map(|o| o.event.external_user_id.as_str()).collect();
    assert!(retained.contains(&"u14"));
    assert!(!retained.contains(&"u0"));
}

#[tokio::test]
async fn per_adapter_order_is_preserved_into_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir, 10_000).await;
    let base = Utc::now().timestamp();

    for i in 0..5 {
        processor.process(raw(&format!("u{i}"), base + i)).await.unwrap();
    }

    let batch = queue.lease_batch(10, usize::MAX).await.unwrap();
    let ids: Vec<u64> = batch.iter().map(|o| o.queue_id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted, "batch must be ordered by queue id");

    let users: Vec<&str> = batch.iter().map(|o| o.event.external_user_id.as_str()).collect();
    assert_eq!(users, vec!["u0", "u1", "u2", "u3", "u4"]);
}
