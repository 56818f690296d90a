//! In-memory event store, for testing only.
//!
//! Mirrors the transactional semantics of the redb backend over a `BTreeMap`
//! guarded by one async mutex: every trait method takes the lock once, so a
//! call is atomic with respect to every other call. Data is lost on drop.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use crate::{
    AckFailedReport, CompactionReport, CompactionTtls, EnqueueLimits, EnqueueOutcome, EntryStatus,
    EventPage, EventRecord, EventStore, QueueEntry, QueueStats, StorageError,
};

#[derive(Default)]
struct Inner {
    /// queue_id → entry. BTreeMap keeps FIFO order by queue id.
    entries: BTreeMap<u64, QueueEntry>,
    /// event_id → event timestamp (ms).
    dedup: HashMap<String, i64>,
    next_queue_id: u64,
}

/// An event store held entirely in memory.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
}

impl MemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_queue_id: 1,
                ..Inner::default()
            }),
        }
    }
}

impl std::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventStore").finish_non_exhaustive()
    }
}

fn entry_size(entry: &QueueEntry) -> usize {
    // Approximates the serialized footprint the redb backend accounts for.
    serde_json::to_vec(entry).map_or(0, |v| v.len())
}

fn leasable(entry: &QueueEntry, now_ms: i64) -> bool {
    match entry.status {
        EntryStatus::Pending => true,
        EntryStatus::InFlight => entry
            .lease_expires_at_ms
            .is_none_or(|deadline| deadline <= now_ms),
        EntryStatus::Sent | EntryStatus::Failed => false,
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryEventStore {
    async fn enqueue(
        &self,
        event: EventRecord,
        dedup_probes: &[String],
        limits: EnqueueLimits,
        now_ms: i64,
    ) -> Result<EnqueueOutcome, StorageError> {
        let mut inner = self.inner.lock().await;

        for probe in dedup_probes {
            if let Some(seen_ms) = inner.dedup.get(probe) {
                if (event.timestamp_ms - seen_ms).abs() <= limits.dedup_window_ms {
                    return Ok(EnqueueOutcome::Duplicate);
                }
            }
        }

        let active = inner
            .entries
            .values()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight))
            .count() as u64;
        let pending_ids: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.queue_id)
            .collect();

        let needed = (active.saturating_add(1)).saturating_sub(limits.queue_max_size) as usize;
        if needed > pending_ids.len() {
            return Ok(EnqueueOutcome::Full);
        }

        let mut evicted = Vec::with_capacity(needed);
        for queue_id in pending_ids.into_iter().take(needed) {
            if let Some(entry) = inner.entries.remove(&queue_id) {
                evicted.push(entry);
            }
        }

        let queue_id = inner.next_queue_id;
        inner.next_queue_id = inner.next_queue_id.saturating_add(1);
        inner.dedup.insert(event.event_id.clone(), event.timestamp_ms);
        inner.entries.insert(
            queue_id,
            QueueEntry {
                queue_id,
                status: EntryStatus::Pending,
                retry_count: 0,
                first_queued_at_ms: now_ms,
                last_attempt_at_ms: None,
                sent_at_ms: None,
                lease_expires_at_ms: None,
                event,
            },
        );

        Ok(EnqueueOutcome::Inserted { queue_id, evicted })
    }

    async fn lease_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let mut inner = self.inner.lock().await;

        let mut selected: Vec<u64> = Vec::new();
        let mut total_bytes: usize = 0;
        for entry in inner.entries.values() {
            if selected.len() >= max_count {
                break;
            }
            if !leasable(entry, now_ms) {
                continue;
            }
            let size = entry_size(entry);
            if !selected.is_empty() && total_bytes.saturating_add(size) > max_bytes {
                break;
            }
            total_bytes = total_bytes.saturating_add(size);
            selected.push(entry.queue_id);
        }

        let mut leased = Vec::with_capacity(selected.len());
        for queue_id in selected {
            if let Some(entry) = inner.entries.get_mut(&queue_id) {
                entry.status = EntryStatus::InFlight;
                entry.lease_expires_at_ms = Some(now_ms.saturating_add(lease_ttl_ms));
                entry.last_attempt_at_ms = Some(now_ms);
                leased.push(entry.clone());
            }
        }
        Ok(leased)
    }

    async fn ack_sent(&self, queue_ids: &[u64], now_ms: i64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        for queue_id in queue_ids {
            if let Some(entry) = inner.entries.get_mut(queue_id) {
                entry.status = EntryStatus::Sent;
                entry.sent_at_ms = Some(now_ms);
                entry.lease_expires_at_ms = None;
            }
        }
        Ok(())
    }

    async fn ack_failed(
        &self,
        queue_ids: &[u64],
        retriable: bool,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<AckFailedReport, StorageError> {
        let mut inner = self.inner.lock().await;
        let mut report = AckFailedReport::default();
        for queue_id in queue_ids {
            if let Some(entry) = inner.entries.get_mut(queue_id) {
                entry.retry_count = entry.retry_count.saturating_add(1);
                entry.last_attempt_at_ms = Some(now_ms);
                entry.lease_expires_at_ms = None;
                if !retriable || entry.retry_count >= max_attempts {
                    entry.status = EntryStatus::Failed;
                    report.failed = report.failed.saturating_add(1);
                } else {
                    entry.status = EntryStatus::Pending;
                    report.requeued = report.requeued.saturating_add(1);
                }
            }
        }
        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for entry in inner.entries.values() {
            stats.total_bytes = stats.total_bytes.saturating_add(entry_size(entry) as u64);
            match entry.status {
                EntryStatus::Pending => stats.pending = stats.pending.saturating_add(1),
                EntryStatus::InFlight => stats.in_flight = stats.in_flight.saturating_add(1),
                EntryStatus::Sent => stats.sent = stats.sent.saturating_add(1),
                EntryStatus::Failed => stats.failed = stats.failed.saturating_add(1),
            }
        }
        Ok(stats)
    }

    async fn compact(
        &self,
        ttls: CompactionTtls,
        now_ms: i64,
    ) -> Result<CompactionReport, StorageError> {
        let mut inner = self.inner.lock().await;
        let mut report = CompactionReport::default();

        let stale: Vec<u64> = inner
            .entries
            .values()
            .filter(|e| match e.status {
                EntryStatus::Sent => {
                    e.sent_at_ms.unwrap_or(e.first_queued_at_ms)
                        <= now_ms.saturating_sub(ttls.sent_ttl_ms)
                }
                EntryStatus::Failed => {
                    e.last_attempt_at_ms.unwrap_or(e.first_queued_at_ms)
                        <= now_ms.saturating_sub(ttls.failed_ttl_ms)
                }
                EntryStatus::Pending | EntryStatus::InFlight => false,
            })
            .map(|e| e.queue_id)
            .collect();
        for queue_id in stale {
            if let Some(entry) = inner.entries.remove(&queue_id) {
                match entry.status {
                    EntryStatus::Sent => report.sent_removed = report.sent_removed.saturating_add(1),
                    EntryStatus::Failed => {
                        report.failed_removed = report.failed_removed.saturating_add(1);
                    }
                    EntryStatus::Pending | EntryStatus::InFlight => {}
                }
            }
        }

        let cutoff = now_ms.saturating_sub(ttls.dedup_ttl_ms);
        let before = inner.dedup.len();
        inner.dedup.retain(|_, ts| *ts > cutoff);
        report.dedup_pruned = (before - inner.dedup.len()) as u64;

        Ok(report)
    }

    async fn recover(&self, now_ms: i64) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;
        let mut reset: u64 = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == EntryStatus::InFlight
                && entry
                    .lease_expires_at_ms
                    .is_none_or(|deadline| deadline <= now_ms)
            {
                entry.status = EntryStatus::Pending;
                entry.lease_expires_at_ms = None;
                reset = reset.saturating_add(1);
            }
        }
        Ok(reset)
    }

    async fn recent_events(
        &self,
        limit: usize,
        cursor: Option<u64>,
        since_ms: Option<i64>,
    ) -> Result<EventPage, StorageError> {
        let inner = self.inner.lock().await;
        let upper = cursor.unwrap_or(u64::MAX);

        let mut page: Vec<QueueEntry> = Vec::new();
        for entry in inner.entries.range(..upper).rev().map(|(_, e)| e) {
            if page.len() >= limit {
                break;
            }
            if let Some(since) = since_ms {
                if entry.event.timestamp_ms < since {
                    continue;
                }
            }
            page.push(entry.clone());
        }

        let next_cursor = if page.len() >= limit {
            page.last().map(|e| e.queue_id)
        } else {
            None
        };
        Ok(EventPage {
            entries: page,
            next_cursor,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const WINDOW_MS: i64 = 300_000;

    fn record(event_id: &str, user: &str, ts_ms: i64) -> EventRecord {
        EventRecord {
            event_id: event_id.to_owned(),
            device_id: "dev_x".to_owned(),
            external_user_id: user.to_owned(),
            timestamp_ms: ts_ms,
            event_type: "entry".to_owned(),
            is_simulated: false,
            payload: b"sealed".to_vec(),
        }
    }

    fn limits(max: u64) -> EnqueueLimits {
        EnqueueLimits {
            queue_max_size: max,
            dedup_window_ms: WINDOW_MS,
        }
    }

    async fn enqueue_one(store: &MemoryEventStore, id: &str, ts: i64) -> EnqueueOutcome {
        store
            .enqueue(record(id, "u1", ts), &[id.to_owned()], limits(100), ts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_assigns_monotonic_ids() {
        let store = MemoryEventStore::new();
        let EnqueueOutcome::Inserted { queue_id: a, .. } = enqueue_one(&store, "e1", 1_000).await
        else {
            panic!("expected insert");
        };
        let EnqueueOutcome::Inserted { queue_id: b, .. } = enqueue_one(&store, "e2", 400_000).await
        else {
            panic!("expected insert");
        };
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn duplicate_within_window_is_rejected() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        let outcome = store
            .enqueue(
                record("e1b", "u1", 11_000),
                &["e1b".to_owned(), "e1".to_owned()],
                limits(100),
                11_000,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Duplicate));
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn same_event_outside_window_is_admitted() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        let outcome = store
            .enqueue(
                record("e2", "u1", 1_000 + WINDOW_MS + 1),
                &["e2".to_owned(), "e1".to_owned()],
                limits(100),
                1_000 + WINDOW_MS + 1,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Inserted { .. }));
    }

    #[tokio::test]
    async fn eviction_targets_oldest_pending_first() {
        let store = MemoryEventStore::new();
        for i in 0..3u32 {
            let id = format!("e{i}");
            let ts = i64::from(i) * 400_000;
            store
                .enqueue(record(&id, "u1", ts), &[id.clone()], limits(3), ts)
                .await
                .unwrap();
        }
        let outcome = store
            .enqueue(
                record("e9", "u1", 2_000_000),
                &["e9".to_owned()],
                limits(3),
                2_000_000,
            )
            .await
            .unwrap();
        let EnqueueOutcome::Inserted { evicted, .. } = outcome else {
            panic!("expected insert with eviction");
        };
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].event.event_id, "e0");
        assert_eq!(store.stats().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn full_when_everything_is_in_flight() {
        let store = MemoryEventStore::new();
        for i in 0..2u32 {
            let id = format!("e{i}");
            let ts = i64::from(i) * 400_000;
            store
                .enqueue(record(&id, "u1", ts), &[id.clone()], limits(2), ts)
                .await
                .unwrap();
        }
        let leased = store.lease_batch(10, usize::MAX, 60_000, 1_000_000).await.unwrap();
        assert_eq!(leased.len(), 2);

        let outcome = store
            .enqueue(
                record("e9", "u1", 2_000_000),
                &["e9".to_owned()],
                limits(2),
                2_000_000,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Full));
    }

    #[tokio::test]
    async fn leased_entries_are_invisible_until_lease_expires() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;

        let first = store.lease_batch(10, usize::MAX, 60_000, 10_000).await.unwrap();
        assert_eq!(first.len(), 1);

        // Within the lease window nothing is visible.
        let hidden = store.lease_batch(10, usize::MAX, 60_000, 20_000).await.unwrap();
        assert!(hidden.is_empty());

        // After expiry it is leasable again, retry count untouched.
        let again = store.lease_batch(10, usize::MAX, 60_000, 80_000).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].retry_count, 0);
    }

    #[tokio::test]
    async fn ack_failed_requeues_then_terminates() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        let leased = store.lease_batch(1, usize::MAX, 60_000, 10_000).await.unwrap();
        let id = leased[0].queue_id;

        let report = store.ack_failed(&[id], true, 3, 11_000).await.unwrap();
        assert_eq!(report.requeued, 1);

        store.lease_batch(1, usize::MAX, 60_000, 12_000).await.unwrap();
        store.ack_failed(&[id], true, 3, 13_000).await.unwrap();
        store.lease_batch(1, usize::MAX, 60_000, 14_000).await.unwrap();
        let report = store.ack_failed(&[id], true, 3, 15_000).await.unwrap();
        assert_eq!(report.failed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn non_retriable_failure_is_terminal_immediately() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        let leased = store.lease_batch(1, usize::MAX, 60_000, 10_000).await.unwrap();

        let report = store
            .ack_failed(&[leased[0].queue_id], false, 10, 11_000)
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn compact_removes_aged_sent_and_prunes_dedup() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        let leased = store.lease_batch(1, usize::MAX, 60_000, 2_000).await.unwrap();
        store.ack_sent(&[leased[0].queue_id], 3_000).await.unwrap();

        let report = store
            .compact(
                CompactionTtls {
                    sent_ttl_ms: 3_600_000,
                    failed_ttl_ms: 604_800_000,
                    dedup_ttl_ms: WINDOW_MS + 60_000,
                },
                3_000 + 3_600_001,
            )
            .await
            .unwrap();
        assert_eq!(report.sent_removed, 1);
        assert_eq!(report.dedup_pruned, 1);
        assert_eq!(store.stats().await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn recover_resets_expired_leases_only() {
        let store = MemoryEventStore::new();
        enqueue_one(&store, "e1", 1_000).await;
        enqueue_one(&store, "e2", 400_000).await;
        store.lease_batch(1, usize::MAX, 60_000, 500_000).await.unwrap();

        // Lease still live: nothing to recover.
        assert_eq!(store.recover(510_000).await.unwrap(), 0);
        // Lease expired: the in-flight entry goes back to pending.
        assert_eq!(store.recover(600_001).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn recent_events_pages_newest_first() {
        let store = MemoryEventStore::new();
        for i in 0..5u32 {
            let id = format!("e{i}");
            let ts = i64::from(i) * 400_000;
            store
                .enqueue(record(&id, "u1", ts), &[id.clone()], limits(100), ts)
                .await
                .unwrap();
        }

        let first = store.recent_events(2, None, None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].event.event_id, "e4");
        assert_eq!(first.entries[1].event.event_id, "e3");

        let second = store
            .recent_events(2, first.next_cursor, None)
            .await
            .unwrap();
        assert_eq!(second.entries[0].event.event_id, "e2");
    }
}
