//! The durable queue: at-least-once delivery policy over an [`EventStore`].
//!
//! The storage layer provides the transactions; this layer provides the
//! policy around them — sealing payloads before they touch disk, writing
//! evicted entries to the dead-letter log, bounding the queue by the active
//! tier, and the retention windows the compactor applies.
//!
//! # Payload encryption
//!
//! Event `raw_data` is sealed with AES-256-GCM under a random payload key
//! generated at first open. The payload key itself is stored next to the
//! database, wrapped under a key-encryption key derived from the device
//! credential (or the machine-bound key while unpaired). Key rotation and
//! pairing therefore re-wrap one small file instead of re-encrypting the
//! queue.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use bridge_storage::{
    CompactionReport, CompactionTtls, EnqueueLimits, EnqueueOutcome, EventRecord, EventStore,
    QueueEntry, QueueStats,
};

use crate::crypto::{self, EncryptionKey};
use crate::deadletter::{DeadLetterEntry, DeadLetterLog};
use crate::error::QueueError;
use crate::event::{self, EventType, StandardEvent};

/// How long a leased batch stays invisible before it is retryable.
pub const LEASE_TTL: Duration = Duration::from_secs(60);

/// Sent entries are kept this long for inspection before compaction.
const SENT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Terminal failures are kept this long for forensics.
const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Dedup rows outlive the window by this slack before pruning.
const DEDUP_SLACK: Duration = Duration::from_secs(60);

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Admitted under this queue id.
    Queued(u64),
    /// Suppressed by the dedup window; nothing was stored.
    Duplicate,
}

/// A leased event ready for submission, payload already unsealed.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub queue_id: u64,
    pub retry_count: u32,
    pub event: StandardEvent,
}

/// A queue entry for the local API, payload unsealed when possible.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntryView {
    pub queue_id: u64,
    pub status: bridge_storage::EntryStatus,
    pub retry_count: u32,
    pub event: StandardEvent,
}

/// Monotonic counters the status endpoint reports.
#[derive(Debug, Default)]
pub struct QueueCounters {
    pub enqueued: AtomicU64,
    pub evicted: AtomicU64,
}

/// Snapshot of [`QueueCounters`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueCountersSnapshot {
    pub enqueued: u64,
    pub evicted: u64,
}

/// The durable queue.
pub struct DurableQueue {
    store: Arc<dyn EventStore>,
    dead_letter: Arc<DeadLetterLog>,
    payload_key: EncryptionKey,
    max_size: AtomicU64,
    dedup_window_ms: i64,
    max_attempts: u32,
    counters: QueueCounters,
}

impl DurableQueue {
    /// Build the queue and run crash recovery: in-flight entries whose lease
    /// expired go back to pending before anything else happens.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if recovery fails.
    pub async fn open(
        store: Arc<dyn EventStore>,
        dead_letter: Arc<DeadLetterLog>,
        payload_key: EncryptionKey,
        queue_max_size: u64,
        dedup_window: Duration,
        max_attempts: u32,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            store,
            dead_letter,
            payload_key,
            max_size: AtomicU64::new(queue_max_size),
            dedup_window_ms: dedup_window.as_millis() as i64,
            max_attempts,
            counters: QueueCounters::default(),
        };

        let reset = queue.store.recover(Utc::now().timestamp_millis()).await?;
        if reset > 0 {
            tracing::info!(reset, "recovered in-flight entries from unclean shutdown");
        }
        Ok(queue)
    }

    /// Admit a standard event: seal the payload, dedup, enforce the bound,
    /// and dead-letter anything evicted to make room — one transaction plus
    /// the dead-letter append.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Full`] when every retained entry is in-flight.
    /// - [`QueueError::Crypto`] if sealing fails.
    /// - [`QueueError::Storage`] if the transaction fails.
    pub async fn enqueue(&self, event: &StandardEvent) -> Result<Enqueued, QueueError> {
        let plaintext =
            serde_json::to_vec(&event.raw_data).map_err(|e| QueueError::Serialization {
                reason: format!("raw_data serialize: {e}"),
            })?;
        let payload = crypto::encrypt(&self.payload_key, &plaintext)?;

        let record = EventRecord {
            event_id: event.event_id.clone(),
            device_id: event.device_id.clone(),
            external_user_id: event.external_user_id.clone(),
            timestamp_ms: event.timestamp.timestamp_millis(),
            event_type: event.event_type.as_str().to_owned(),
            is_simulated: event.is_simulated,
            payload,
        };
        let probes = event::dedup_probes(
            &event.device_id,
            &event.external_user_id,
            event.event_type,
            event.timestamp,
            self.dedup_window_ms / 1_000,
        );
        let limits = EnqueueLimits {
            queue_max_size: self.max_size.load(Ordering::Relaxed),
            dedup_window_ms: self.dedup_window_ms,
        };

        let now = Utc::now();
        let outcome = self
            .store
            .enqueue(record, &probes, limits, now.timestamp_millis())
            .await?;

        match outcome {
            EnqueueOutcome::Inserted { queue_id, evicted } => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                for entry in &evicted {
                    self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        queue_id = entry.queue_id,
                        event_id = %entry.event.event_id,
                        "queue at capacity, oldest pending entry evicted to dead-letter log"
                    );
                    self.dead_letter
                        .append(&DeadLetterEntry::from_evicted(entry, now))
                        .await?;
                }
                Ok(Enqueued::Queued(queue_id))
            }
            EnqueueOutcome::Duplicate => Ok(Enqueued::Duplicate),
            EnqueueOutcome::Full => Err(QueueError::Full),
        }
    }

    /// Lease up to `max_count` entries (`max_bytes` of stored payload),
    /// unsealing them for transit. Entries whose payload can no longer be
    /// unsealed are failed terminally instead of wedging the batch.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the lease transaction fails.
    pub async fn lease_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<OutboundEvent>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let leased = self
            .store
            .lease_batch(max_count, max_bytes, LEASE_TTL.as_millis() as i64, now_ms)
            .await?;

        let mut out = Vec::with_capacity(leased.len());
        let mut unreadable: Vec<u64> = Vec::new();
        for entry in leased {
            match self.unseal(&entry) {
                Ok(event) => out.push(OutboundEvent {
                    queue_id: entry.queue_id,
                    retry_count: entry.retry_count,
                    event,
                }),
                Err(e) => {
                    tracing::error!(
                        queue_id = entry.queue_id,
                        event_id = %entry.event.event_id,
                        error = %e,
                        "payload unreadable, failing entry terminally"
                    );
                    unreadable.push(entry.queue_id);
                }
            }
        }
        if !unreadable.is_empty() {
            self.store
                .ack_failed(&unreadable, false, self.max_attempts, now_ms)
                .await?;
        }
        Ok(out)
    }

    /// Mark entries delivered.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the transaction fails.
    pub async fn ack_sent(&self, queue_ids: &[u64]) -> Result<(), QueueError> {
        self.store
            .ack_sent(queue_ids, Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    /// Record a failed delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the transaction fails.
    pub async fn ack_failed(
        &self,
        queue_ids: &[u64],
        reason: &str,
        retriable: bool,
    ) -> Result<(), QueueError> {
        let report = self
            .store
            .ack_failed(
                queue_ids,
                retriable,
                self.max_attempts,
                Utc::now().timestamp_millis(),
            )
            .await?;
        if report.failed > 0 {
            tracing::warn!(
                failed = report.failed,
                requeued = report.requeued,
                reason,
                "entries reached terminal failure"
            );
        }
        Ok(())
    }

    /// Occupancy counters from the store.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the read fails.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// Snapshot of the queue-side counters.
    #[must_use]
    pub fn counters(&self) -> QueueCountersSnapshot {
        QueueCountersSnapshot {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Adjust the size bound (tier transitions). Applies to future
    /// admissions; current contents are not trimmed.
    pub fn set_max_size(&self, queue_max_size: u64) {
        self.max_size.store(queue_max_size.max(1), Ordering::Relaxed);
    }

    /// One compaction pass with the standard retention windows. The caller
    /// runs this no more than once per minute.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the transaction fails.
    pub async fn compact_once(&self) -> Result<CompactionReport, QueueError> {
        let ttls = CompactionTtls {
            sent_ttl_ms: SENT_RETENTION.as_millis() as i64,
            failed_ttl_ms: FAILED_RETENTION.as_millis() as i64,
            dedup_ttl_ms: self.dedup_window_ms + DEDUP_SLACK.as_millis() as i64,
        };
        let report = self
            .store
            .compact(ttls, Utc::now().timestamp_millis())
            .await?;
        if report.sent_removed + report.failed_removed + report.dedup_pruned > 0 {
            tracing::debug!(
                sent_removed = report.sent_removed,
                failed_removed = report.failed_removed,
                dedup_pruned = report.dedup_pruned,
                "queue compaction pass complete"
            );
        }
        Ok(report)
    }

    /// Page through retained entries for the local API, newest first.
    /// Entries with unreadable payloads are shown without `raw_data`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the read fails.
    pub async fn recent(
        &self,
        limit: usize,
        cursor: Option<u64>,
        since_ms: Option<i64>,
    ) -> Result<(Vec<EntryView>, Option<u64>), QueueError> {
        let page = self.store.recent_events(limit, cursor, since_ms).await?;
        let views = page
            .entries
            .iter()
            .map(|entry| {
                let event = self.unseal(entry).unwrap_or_else(|_| StandardEvent {
                    event_id: entry.event.event_id.clone(),
                    device_id: entry.event.device_id.clone(),
                    external_user_id: entry.event.external_user_id.clone(),
                    timestamp: chrono::DateTime::from_timestamp_millis(entry.event.timestamp_ms)
                        .unwrap_or_else(Utc::now),
                    event_type: entry.event.event_type.parse().unwrap_or(EventType::Entry),
                    is_simulated: entry.event.is_simulated,
                    raw_data: serde_json::Map::new(),
                });
                EntryView {
                    queue_id: entry.queue_id,
                    status: entry.status,
                    retry_count: entry.retry_count,
                    event,
                }
            })
            .collect();
        Ok((views, page.next_cursor))
    }

    fn unseal(&self, entry: &QueueEntry) -> Result<StandardEvent, QueueError> {
        let plaintext = crypto::decrypt(&self.payload_key, &entry.event.payload)?;
        let raw_data: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&plaintext).map_err(|e| QueueError::Serialization {
                reason: format!("raw_data deserialize: {e}"),
            })?;
        let event_type: EventType = entry
            .event
            .event_type
            .parse()
            .map_err(|reason: String| QueueError::Serialization { reason })?;
        Ok(StandardEvent {
            event_id: entry.event.event_id.clone(),
            device_id: entry.event.device_id.clone(),
            external_user_id: entry.event.external_user_id.clone(),
            timestamp: chrono::DateTime::from_timestamp_millis(entry.event.timestamp_ms)
                .unwrap_or_else(Utc::now),
            event_type,
            is_simulated: entry.event.is_simulated,
            raw_data,
        })
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("max_size", &self.max_size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Load the wrapped payload key from `path`, creating and wrapping a fresh
/// one on first run.
///
/// The file holds `encrypt(kek, payload_key)`. Rotation and pairing call
/// [`rewrap_payload_key`] so the queue contents never need re-encryption.
///
/// # Errors
///
/// Returns [`QueueError::Corrupt`] if the file exists but does not unwrap,
/// or cannot be read or written — the operator must restore the key file or
/// reset the database.
pub fn load_or_create_payload_key(
    path: &Path,
    kek: &EncryptionKey,
) -> Result<EncryptionKey, QueueError> {
    match std::fs::read(path) {
        Ok(wrapped) => {
            let bytes = crypto::decrypt(kek, &wrapped).map_err(|e| QueueError::Corrupt {
                path: path.display().to_string(),
                reason: format!("payload key unwrap failed: {e}"),
            })?;
            let key = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| QueueError::Corrupt {
                path: path.display().to_string(),
                reason: format!("payload key must be 32 bytes, got {}", bytes.len()),
            })?;
            Ok(EncryptionKey::from_bytes(key))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = EncryptionKey::generate();
            write_wrapped_key(path, kek, &key)?;
            Ok(key)
        }
        Err(e) => Err(QueueError::Corrupt {
            path: path.display().to_string(),
            reason: format!("payload key file unreadable: {e}"),
        }),
    }
}

/// Re-wrap the payload key under a new key-encryption key (pairing, key
/// rotation).
///
/// # Errors
///
/// Returns [`QueueError::Corrupt`] if the existing file does not unwrap
/// under `old_kek` or cannot be rewritten.
pub fn rewrap_payload_key(
    path: &Path,
    old_kek: &EncryptionKey,
    new_kek: &EncryptionKey,
) -> Result<(), QueueError> {
    let key = load_or_create_payload_key(path, old_kek)?;
    write_wrapped_key(path, new_kek, &key)
}

fn write_wrapped_key(
    path: &Path,
    kek: &EncryptionKey,
    key: &EncryptionKey,
) -> Result<(), QueueError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QueueError::Corrupt {
            path: parent.display().to_string(),
            reason: format!("create parent: {e}"),
        })?;
    }
    let wrapped = crypto::encrypt(kek, key.as_bytes())?;
    std::fs::write(path, &wrapped).map_err(|e| QueueError::Corrupt {
        path: path.display().to_string(),
        reason: format!("payload key write failed: {e}"),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bridge_storage::MemoryEventStore;
    use chrono::TimeZone;

    async fn queue(dir: &tempfile::TempDir, max: u64) -> DurableQueue {
        DurableQueue::open(
            Arc::new(MemoryEventStore::new()),
            Arc::new(DeadLetterLog::new(dir.path().join("deadletter.jsonl"))),
            EncryptionKey::generate(),
            max,
            Duration::from_secs(300),
            3,
        )
        .await
        .unwrap()
    }

    fn standard_event(user: &str, secs: i64) -> StandardEvent {
        let timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        let mut raw_data = serde_json::Map::new();
        raw_data.insert("slot".to_owned(), serde_json::Value::from(4));
        StandardEvent {
            event_id: event::event_id("dev_x", user, EventType::Entry, timestamp, 300),
            device_id: "dev_x".to_owned(),
            external_user_id: user.to_owned(),
            timestamp,
            event_type: EventType::Entry,
            is_simulated: false,
            raw_data,
        }
    }

    #[tokio::test]
    async fn enqueue_lease_round_trips_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 100).await;

        let event = standard_event("u1", 10_000);
        assert!(matches!(
            q.enqueue(&event).await.unwrap(),
            Enqueued::Queued(_)
        ));

        let batch = q.lease_batch(10, usize::MAX).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.event_id, event.event_id);
        assert_eq!(batch[0].event.raw_data["slot"], 4);
    }

    #[tokio::test]
    async fn duplicate_within_window_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 100).await;

        q.enqueue(&standard_event("u1", 10_000)).await.unwrap();
        // Ten seconds later, same user, same type: one event.
        let second = q.enqueue(&standard_event("u1", 10_010)).await.unwrap();
        assert_eq!(second, Enqueued::Duplicate);
        assert_eq!(q.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn overflow_dead_letters_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 10).await;

        // 15 distinct users so dedup does not interfere.
        for i in 0..15 {
            let user = format!("u{i}");
            q.enqueue(&standard_event(&user, 10_000 + i * 1_000))
                .await
                .unwrap();
        }

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 10);
        assert_eq!(q.counters().evicted, 5);

        let dead = DeadLetterLog::new(dir.path().join("deadletter.jsonl"));
        let lines = dead.tail(100).await.unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].external_user_id, "u0");
        assert_eq!(lines[4].external_user_id, "u4");
    }

    #[tokio::test]
    async fn ack_failed_respects_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 100).await;
        q.enqueue(&standard_event("u1", 10_000)).await.unwrap();

        for _ in 0..3 {
            let batch = q.lease_batch(1, usize::MAX).await.unwrap();
            if batch.is_empty() {
                break;
            }
            q.ack_failed(&[batch[0].queue_id], "http 503", true)
                .await
                .unwrap();
        }

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn recent_exposes_entries_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir, 100).await;
        for i in 0..4 {
            let user = format!("u{i}");
            q.enqueue(&standard_event(&user, 10_000 + i * 1_000))
                .await
                .unwrap();
        }

        let (views, _next) = q.recent(2, None, None).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].event.external_user_id, "u3");
        assert_eq!(views[0].event.raw_data["slot"], 4);
    }

    #[test]
    fn payload_key_round_trips_and_rewraps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db.key");
        let kek_a = EncryptionKey::generate();
        let kek_b = EncryptionKey::generate();

        let created = load_or_create_payload_key(&path, &kek_a).unwrap();
        let loaded = load_or_create_payload_key(&path, &kek_a).unwrap();
        assert_eq!(created.as_bytes(), loaded.as_bytes());

        rewrap_payload_key(&path, &kek_a, &kek_b).unwrap();
        let rewrapped = load_or_create_payload_key(&path, &kek_b).unwrap();
        assert_eq!(created.as_bytes(), rewrapped.as_bytes());

        // The old KEK no longer opens it.
        assert!(matches!(
            load_or_create_payload_key(&path, &kek_a),
            Err(QueueError::Corrupt { .. })
        ));
    }
}
