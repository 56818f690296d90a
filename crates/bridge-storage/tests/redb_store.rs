//! On-disk behavior of the redb backend: durability across reopen and
//! crash recovery of expired leases.

#![allow(clippy::unwrap_used)]

use bridge_storage::{
    EnqueueLimits, EnqueueOutcome, EventRecord, EventStore, RedbEventStore,
};

const WINDOW_MS: i64 = 300_000;

fn record(event_id: &str, ts_ms: i64) -> EventRecord {
    EventRecord {
        event_id: event_id.to_owned(),
        device_id: "dev_x".to_owned(),
        external_user_id: "u1".to_owned(),
        timestamp_ms: ts_ms,
        event_type: "entry".to_owned(),
        is_simulated: false,
        payload: b"sealed-bytes".to_vec(),
    }
}

fn limits() -> EnqueueLimits {
    EnqueueLimits {
        queue_max_size: 100,
        dedup_window_ms: WINDOW_MS,
    }
}

#[tokio::test]
async fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    {
        let store = RedbEventStore::open(&path).unwrap();
        for i in 0..5u32 {
            let id = format!("e{i}");
            let ts = i64::from(i) * 400_000;
            let outcome = store
                .enqueue(record(&id, ts), &[id.clone()], limits(), ts)
                .await
                .unwrap();
            assert!(matches!(outcome, EnqueueOutcome::Inserted { .. }));
        }
    }

    let store = RedbEventStore::open(&path).unwrap();
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 5);
    assert!(stats.total_bytes > 0);
}

#[tokio::test]
async fn queue_ids_are_not_reused_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    let first_id = {
        let store = RedbEventStore::open(&path).unwrap();
        let EnqueueOutcome::Inserted { queue_id, .. } = store
            .enqueue(record("e1", 1_000), &["e1".to_owned()], limits(), 1_000)
            .await
            .unwrap()
        else {
            unreachable!("insert into empty store cannot fail");
        };
        // Sending + compacting removes the entry, but its id stays burned.
        store.ack_sent(&[queue_id], 2_000).await.unwrap();
        queue_id
    };

    let store = RedbEventStore::open(&path).unwrap();
    let EnqueueOutcome::Inserted { queue_id, .. } = store
        .enqueue(record("e2", 400_000), &["e2".to_owned()], limits(), 400_000)
        .await
        .unwrap()
    else {
        unreachable!("insert cannot collide");
    };
    assert!(queue_id > first_id);
}

#[tokio::test]
async fn expired_leases_recover_after_unclean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    {
        let store = RedbEventStore::open(&path).unwrap();
        store
            .enqueue(record("e1", 1_000), &["e1".to_owned()], limits(), 1_000)
            .await
            .unwrap();
        let leased = store
            .lease_batch(10, usize::MAX, 60_000, 10_000)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        // Drop without acking — the process "died" mid-flight.
    }

    let store = RedbEventStore::open(&path).unwrap();
    let reset = store.recover(80_000).await.unwrap();
    assert_eq!(reset, 1);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_flight, 0);

    // Retry bookkeeping untouched by recovery.
    let leased = store
        .lease_batch(10, usize::MAX, 60_000, 90_000)
        .await
        .unwrap();
    assert_eq!(leased[0].retry_count, 0);
}

#[tokio::test]
async fn dedup_holds_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    {
        let store = RedbEventStore::open(&path).unwrap();
        store
            .enqueue(record("e1", 1_000), &["e1".to_owned()], limits(), 1_000)
            .await
            .unwrap();
    }

    let store = RedbEventStore::open(&path).unwrap();
    let outcome = store
        .enqueue(record("e1", 11_000), &["e1".to_owned()], limits(), 11_000)
        .await
        .unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Duplicate));
}
