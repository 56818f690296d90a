//! The event processor: validation, enrichment, dedup, enqueue.
//!
//! Sits between the adapter sink and the durable queue. Every raw event is
//! validated, stamped with the device id, given its deterministic event id,
//! and admitted through the queue's transactional dedup check. Invalid
//! events are counted and logged but never enqueued; duplicates are counted
//! and dropped silently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration as ChronoDuration, Utc};

use crate::error::{ProcessorError, QueueError};
use crate::event::{self, RawHardwareEvent, StandardEvent};
use crate::queue::{DurableQueue, Enqueued};

/// Adapter name whose events are flagged `is_simulated`.
const SIMULATOR_ADAPTER: &str = "simulator";

/// Events dated more than this far from now are clamped to now.
const MAX_TIMESTAMP_DRIFT_HOURS: i64 = 24;

/// What happened to one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Admitted to the queue under this id.
    Queued(u64),
    /// Suppressed by the dedup window.
    Duplicate,
    /// Failed validation and was dropped.
    Invalid,
}

/// Pipeline counters surfaced by the status endpoint.
#[derive(Debug, Default)]
struct ProcessorCounters {
    accepted: AtomicU64,
    invalid: AtomicU64,
    duplicates: AtomicU64,
    dropped_full: AtomicU64,
}

/// Snapshot of the processor counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProcessorCountersSnapshot {
    pub accepted: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub dropped_full: u64,
}

/// Turns raw hardware events into queued standard events.
pub struct EventProcessor {
    queue: Arc<DurableQueue>,
    device_id: String,
    dedup_window_secs: i64,
    counters: ProcessorCounters,
}

impl EventProcessor {
    /// Build a processor bound to a device id and queue.
    ///
    /// While unpaired, `device_id` is empty; events still flow so nothing is
    /// lost before pairing completes.
    #[must_use]
    pub fn new(queue: Arc<DurableQueue>, device_id: String, dedup_window_secs: u64) -> Self {
        Self {
            queue,
            device_id,
            dedup_window_secs: dedup_window_secs.max(1) as i64,
            counters: ProcessorCounters::default(),
        }
    }

    /// Process one raw event end to end.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Queue`] when the queue rejects the event
    /// (`Full`, storage failure). Adapters drop the event and count it —
    /// a full queue must never crash an adapter.
    pub async fn process(&self, raw: RawHardwareEvent) -> Result<ProcessOutcome, ProcessorError> {
        let Some(event) = self.standardize(raw) else {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Invalid);
        };

        match self.queue.enqueue(&event).await {
            Ok(Enqueued::Queued(queue_id)) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_id = %event.event_id,
                    queue_id,
                    event_type = %event.event_type,
                    "event queued"
                );
                Ok(ProcessOutcome::Queued(queue_id))
            }
            Ok(Enqueued::Duplicate) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                Ok(ProcessOutcome::Duplicate)
            }
            Err(e @ QueueError::Full) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                Err(ProcessorError::Queue(e))
            }
            Err(e) => Err(ProcessorError::Queue(e)),
        }
    }

    /// Validate and enrich, returning `None` for events that must be dropped.
    fn standardize(&self, raw: RawHardwareEvent) -> Option<StandardEvent> {
        if raw.external_user_id.trim().is_empty() {
            tracing::warn!(
                adapter = %raw.adapter_name,
                event_type = %raw.event_type,
                "dropping event with empty external_user_id"
            );
            return None;
        }

        let now = Utc::now();
        let mut raw_data = raw.raw_data;
        let drift = now.signed_duration_since(raw.timestamp);
        let timestamp = if drift.num_hours().abs() >= MAX_TIMESTAMP_DRIFT_HOURS {
            // Device clocks drift wildly after power loss; keep the original
            // value for diagnosis but index the event at arrival time.
            raw_data.insert(
                "originalTimestamp".to_owned(),
                serde_json::Value::String(raw.timestamp.to_rfc3339()),
            );
            tracing::warn!(
                adapter = %raw.adapter_name,
                original = %raw.timestamp,
                "event timestamp out of range, clamped to now"
            );
            now
        } else {
            raw.timestamp
        };

        let event_id = event::event_id(
            &self.device_id,
            &raw.external_user_id,
            raw.event_type,
            timestamp,
            self.dedup_window_secs,
        );

        Some(StandardEvent {
            event_id,
            device_id: self.device_id.clone(),
            external_user_id: raw.external_user_id,
            timestamp,
            event_type: raw.event_type,
            is_simulated: raw.adapter_name == SIMULATOR_ADAPTER,
            raw_data,
        })
    }

    /// Snapshot of the pipeline counters.
    #[must_use]
    pub fn counters(&self) -> ProcessorCountersSnapshot {
        ProcessorCountersSnapshot {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
        }
    }

    /// The device id events are attributed to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("device_id", &self.device_id)
            .field("dedup_window_secs", &self.dedup_window_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::deadletter::DeadLetterLog;
    use crate::event::EventType;
    use bridge_storage::MemoryEventStore;
    use std::time::Duration;

    async fn processor(dir: &tempfile::TempDir, queue_max: u64) -> EventProcessor {
        let queue = DurableQueue::open(
            Arc::new(MemoryEventStore::new()),
            Arc::new(DeadLetterLog::new(dir.path().join("deadletter.jsonl"))),
            EncryptionKey::generate(),
            queue_max,
            Duration::from_secs(300),
            3,
        )
        .await
        .unwrap();
        EventProcessor::new(Arc::new(queue), "dev_x".to_owned(), 300)
    }

    fn raw(user: &str, adapter: &str) -> RawHardwareEvent {
        RawHardwareEvent {
            external_user_id: user.to_owned(),
            timestamp: Utc::now(),
            event_type: EventType::Entry,
            raw_data: serde_json::Map::new(),
            adapter_name: adapter.to_owned(),
        }
    }

    #[tokio::test]
    async fn valid_event_is_queued_and_enriched() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 100).await;

        let outcome = p.process(raw("u1", "zkteco")).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Queued(_)));
        assert_eq!(p.counters().accepted, 1);
    }

    #[tokio::test]
    async fn empty_user_id_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 100).await;

        let outcome = p.process(raw("  ", "zkteco")).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Invalid);
        assert_eq!(p.counters().invalid, 1);
        assert_eq!(p.counters().accepted, 0);
    }

    #[tokio::test]
    async fn duplicate_within_window_is_counted_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 100).await;

        let ts = Utc::now();
        let mut first = raw("u1", "zkteco");
        first.timestamp = ts;
        let mut second = raw("u1", "zkteco");
        second.timestamp = ts + ChronoDuration::seconds(10);

        p.process(first).await.unwrap();
        let outcome = p.process(second).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Duplicate);
        assert_eq!(p.counters().duplicates, 1);
    }

    #[tokio::test]
    async fn stale_timestamp_is_clamped_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 100).await;

        let mut event = raw("u1", "zkteco");
        event.timestamp = Utc::now() - ChronoDuration::days(30);
        p.process(event).await.unwrap();

        let (views, _) = p.queue.recent(1, None, None).await.unwrap();
        let queued = &views[0].event;
        assert!(queued.raw_data.contains_key("originalTimestamp"));
        assert!(
            Utc::now()
                .signed_duration_since(queued.timestamp)
                .num_seconds()
                .abs()
                < 60
        );
    }

    #[tokio::test]
    async fn simulator_events_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 100).await;

        p.process(raw("u1", "simulator")).await.unwrap();
        let (views, _) = p.queue.recent(1, None, None).await.unwrap();
        assert!(views[0].event.is_simulated);
    }

    #[tokio::test]
    async fn full_queue_surfaces_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir, 1).await;

        p.process(raw("u1", "zkteco")).await.unwrap();
        // Lease the only entry so nothing is evictable.
        p.queue.lease_batch(10, usize::MAX).await.unwrap();

        let err = p.process(raw("u2", "zkteco")).await;
        assert!(matches!(
            err,
            Err(ProcessorError::Queue(QueueError::Full))
        ));
        assert_eq!(p.counters().dropped_full, 1);
    }
}
