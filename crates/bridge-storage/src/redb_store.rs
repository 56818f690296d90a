//! Pure-Rust redb event store — the production default.
//!
//! redb uses a B-tree internally and commits are atomic, which is what gives
//! the queue its no-loss-under-crash property: the enqueue + dedup insert, a
//! lease, or an ack is either fully on disk or not at all. All blocking redb
//! calls are offloaded to the Tokio blocking thread pool.
//!
//! Three tables:
//!
//! - `entries` — `queue_id (u64)` → JSON entry record. The record's `payload`
//!   blob is sealed above this layer; status/timestamps stay cleartext.
//! - `dedup` — `event_id` → event timestamp (ms). Outlives the entry so the
//!   dedup window holds even after compaction.
//! - `meta` — the monotonic `next_queue_id` counter. Persisted so queue ids
//!   are never reused across restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{
    AckFailedReport, CompactionReport, CompactionTtls, EnqueueLimits, EnqueueOutcome, EntryStatus,
    EventPage, EventRecord, EventStore, QueueEntry, QueueStats, StorageError,
};

const ENTRIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entries");
const DEDUP: TableDefinition<&str, i64> = TableDefinition::new("dedup");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in `meta` holding the next queue id to hand out.
const NEXT_QUEUE_ID: &str = "next_queue_id";

/// Everything in a [`QueueEntry`] except the key it is stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    status: EntryStatus,
    retry_count: u32,
    first_queued_at_ms: i64,
    last_attempt_at_ms: Option<i64>,
    sent_at_ms: Option<i64>,
    lease_expires_at_ms: Option<i64>,
    event: EventRecord,
}

impl StoredRecord {
    fn into_entry(self, queue_id: u64) -> QueueEntry {
        QueueEntry {
            queue_id,
            status: self.status,
            retry_count: self.retry_count,
            first_queued_at_ms: self.first_queued_at_ms,
            last_attempt_at_ms: self.last_attempt_at_ms,
            sent_at_ms: self.sent_at_ms,
            lease_expires_at_ms: self.lease_expires_at_ms,
            event: self.event,
        }
    }

    /// Whether this record is visible to a new lease at `now_ms`.
    fn leasable(&self, now_ms: i64) -> bool {
        match self.status {
            EntryStatus::Pending => true,
            EntryStatus::InFlight => self
                .lease_expires_at_ms
                .is_none_or(|deadline| deadline <= now_ms),
            EntryStatus::Sent | EntryStatus::Failed => false,
        }
    }
}

fn encode(queue_id: u64, record: &StoredRecord) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(record).map_err(|e| StorageError::Serialization {
        queue_id,
        reason: e.to_string(),
    })
}

fn decode(queue_id: u64, bytes: &[u8]) -> Result<StoredRecord, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization {
        queue_id,
        reason: e.to_string(),
    })
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn read_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Read {
        reason: e.to_string(),
    }
}

fn write_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Write {
        reason: e.to_string(),
    }
}

/// An event store backed by redb (pure Rust, transactional B-tree).
///
/// Thread-safe via `Arc<Database>`. Blocking redb calls run on the Tokio
/// blocking thread pool.
///
/// # Examples
///
/// ```no_run
/// # use bridge_storage::RedbEventStore;
/// let store = RedbEventStore::open("/var/lib/gym-bridge/bridge.db").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbEventStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEventStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbEventStore {
    /// Open or create the store at the given path.
    ///
    /// Creates the tables and seeds the queue-id counter on first open.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Open`] if the file cannot be created or opened.
    /// - [`StorageError::Corrupt`] if the file exists but redb rejects it —
    ///   the operator must inspect or remove the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(|e| {
            let reason = e.to_string();
            if reason.contains("orrupt") {
                StorageError::Corrupt {
                    path: path.display().to_string(),
                    reason,
                }
            } else {
                StorageError::Open {
                    path: path.display().to_string(),
                    reason,
                }
            }
        })?;

        // Create the tables and seed the counter in one transaction.
        let txn = db.begin_write().map_err(txn_err)?;
        {
            let _entries = txn.open_table(ENTRIES).map_err(txn_err)?;
            let _dedup = txn.open_table(DEDUP).map_err(txn_err)?;
            let mut meta = txn.open_table(META).map_err(txn_err)?;
            let seeded = meta.get(NEXT_QUEUE_ID).map_err(read_err)?.is_some();
            if !seeded {
                meta.insert(NEXT_QUEUE_ID, 1u64).map_err(write_err)?;
            }
        }
        txn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.display(), "event store opened");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Return the filesystem path of this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl EventStore for RedbEventStore {
    async fn enqueue(
        &self,
        event: EventRecord,
        dedup_probes: &[String],
        limits: EnqueueLimits,
        now_ms: i64,
    ) -> Result<EnqueueOutcome, StorageError> {
        let db = Arc::clone(&self.db);
        let probes = dedup_probes.to_vec();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let outcome = {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;
                let mut dedup = txn.open_table(DEDUP).map_err(txn_err)?;
                let mut meta = txn.open_table(META).map_err(txn_err)?;

                // Dedup check: any probe within the window means a duplicate.
                let mut duplicate = false;
                for probe in &probes {
                    if let Some(guard) = dedup.get(probe.as_str()).map_err(read_err)? {
                        let seen_ms = guard.value();
                        if (event.timestamp_ms - seen_ms).abs() <= limits.dedup_window_ms {
                            duplicate = true;
                            break;
                        }
                    }
                }

                if duplicate {
                    EnqueueOutcome::Duplicate
                } else {
                    // Count active entries and gather pending ids oldest-first.
                    let mut active: u64 = 0;
                    let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
                    for item in entries.iter().map_err(read_err)? {
                        let (k, v) = item.map_err(read_err)?;
                        let record = decode(k.value(), v.value())?;
                        match record.status {
                            EntryStatus::Pending => {
                                active = active.saturating_add(1);
                                pending.push((k.value(), v.value().to_vec()));
                            }
                            EntryStatus::InFlight => {
                                active = active.saturating_add(1);
                            }
                            EntryStatus::Sent | EntryStatus::Failed => {}
                        }
                    }

                    let needed = (active.saturating_add(1)).saturating_sub(limits.queue_max_size);
                    if needed as usize > pending.len() {
                        // Everything evictable is already gone; the rest is
                        // in-flight and must not be touched.
                        EnqueueOutcome::Full
                    } else {
                        let mut evicted = Vec::new();
                        for (queue_id, bytes) in pending.into_iter().take(needed as usize) {
                            entries.remove(queue_id).map_err(write_err)?;
                            evicted.push(decode(queue_id, &bytes)?.into_entry(queue_id));
                        }

                        let queue_id = meta
                            .get(NEXT_QUEUE_ID)
                            .map_err(read_err)?
                            .map_or(1, |g| g.value());
                        meta.insert(NEXT_QUEUE_ID, queue_id.saturating_add(1))
                            .map_err(write_err)?;

                        let event_id = event.event_id.clone();
                        let timestamp_ms = event.timestamp_ms;
                        let record = StoredRecord {
                            status: EntryStatus::Pending,
                            retry_count: 0,
                            first_queued_at_ms: now_ms,
                            last_attempt_at_ms: None,
                            sent_at_ms: None,
                            lease_expires_at_ms: None,
                            event,
                        };
                        let bytes = encode(queue_id, &record)?;
                        entries
                            .insert(queue_id, bytes.as_slice())
                            .map_err(write_err)?;
                        dedup
                            .insert(event_id.as_str(), timestamp_ms)
                            .map_err(write_err)?;

                        EnqueueOutcome::Inserted { queue_id, evicted }
                    }
                }
            };
            txn.commit().map_err(txn_err)?;
            Ok(outcome)
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn lease_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let leased = {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;

                // Select oldest-first; the iterator is ascending by queue id.
                let mut selected: Vec<(u64, StoredRecord)> = Vec::new();
                let mut total_bytes: usize = 0;
                for item in entries.iter().map_err(read_err)? {
                    let (k, v) = item.map_err(read_err)?;
                    if selected.len() >= max_count {
                        break;
                    }
                    let record = decode(k.value(), v.value())?;
                    if !record.leasable(now_ms) {
                        continue;
                    }
                    let size = v.value().len();
                    if !selected.is_empty() && total_bytes.saturating_add(size) > max_bytes {
                        break;
                    }
                    total_bytes = total_bytes.saturating_add(size);
                    selected.push((k.value(), record));
                }

                let mut leased = Vec::with_capacity(selected.len());
                for (queue_id, mut record) in selected {
                    record.status = EntryStatus::InFlight;
                    record.lease_expires_at_ms = Some(now_ms.saturating_add(lease_ttl_ms));
                    record.last_attempt_at_ms = Some(now_ms);
                    let bytes = encode(queue_id, &record)?;
                    entries
                        .insert(queue_id, bytes.as_slice())
                        .map_err(write_err)?;
                    leased.push(record.into_entry(queue_id));
                }
                leased
            };
            txn.commit().map_err(txn_err)?;
            Ok(leased)
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn ack_sent(&self, queue_ids: &[u64], now_ms: i64) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let ids = queue_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;
                for queue_id in ids {
                    let Some(bytes) = entries
                        .get(queue_id)
                        .map_err(read_err)?
                        .map(|g| g.value().to_vec())
                    else {
                        continue;
                    };
                    let mut record = decode(queue_id, &bytes)?;
                    record.status = EntryStatus::Sent;
                    record.sent_at_ms = Some(now_ms);
                    record.lease_expires_at_ms = None;
                    let bytes = encode(queue_id, &record)?;
                    entries
                        .insert(queue_id, bytes.as_slice())
                        .map_err(write_err)?;
                }
            }
            txn.commit().map_err(txn_err)?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn ack_failed(
        &self,
        queue_ids: &[u64],
        retriable: bool,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<AckFailedReport, StorageError> {
        let db = Arc::clone(&self.db);
        let ids = queue_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let mut report = AckFailedReport::default();
            {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;
                for queue_id in ids {
                    let Some(bytes) = entries
                        .get(queue_id)
                        .map_err(read_err)?
                        .map(|g| g.value().to_vec())
                    else {
                        continue;
                    };
                    let mut record = decode(queue_id, &bytes)?;
                    record.retry_count = record.retry_count.saturating_add(1);
                    record.last_attempt_at_ms = Some(now_ms);
                    record.lease_expires_at_ms = None;
                    if !retriable || record.retry_count >= max_attempts {
                        record.status = EntryStatus::Failed;
                        report.failed = report.failed.saturating_add(1);
                    } else {
                        record.status = EntryStatus::Pending;
                        report.requeued = report.requeued.saturating_add(1);
                    }
                    let bytes = encode(queue_id, &record)?;
                    entries
                        .insert(queue_id, bytes.as_slice())
                        .map_err(write_err)?;
                }
            }
            txn.commit().map_err(txn_err)?;
            Ok(report)
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn stats(&self) -> Result<QueueStats, StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(txn_err)?;
            let entries = txn.open_table(ENTRIES).map_err(txn_err)?;
            let mut stats = QueueStats::default();
            for item in entries.iter().map_err(read_err)? {
                let (k, v) = item.map_err(read_err)?;
                let record = decode(k.value(), v.value())?;
                stats.total_bytes = stats.total_bytes.saturating_add(v.value().len() as u64);
                match record.status {
                    EntryStatus::Pending => stats.pending = stats.pending.saturating_add(1),
                    EntryStatus::InFlight => stats.in_flight = stats.in_flight.saturating_add(1),
                    EntryStatus::Sent => stats.sent = stats.sent.saturating_add(1),
                    EntryStatus::Failed => stats.failed = stats.failed.saturating_add(1),
                }
            }
            Ok(stats)
        })
        .await
        .map_err(|e| StorageError::Read {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn compact(
        &self,
        ttls: CompactionTtls,
        now_ms: i64,
    ) -> Result<CompactionReport, StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let mut report = CompactionReport::default();
            {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;
                let mut remove_sent: Vec<u64> = Vec::new();
                let mut remove_failed: Vec<u64> = Vec::new();
                for item in entries.iter().map_err(read_err)? {
                    let (k, v) = item.map_err(read_err)?;
                    let record = decode(k.value(), v.value())?;
                    match record.status {
                        EntryStatus::Sent => {
                            let sent_at = record.sent_at_ms.unwrap_or(record.first_queued_at_ms);
                            if sent_at <= now_ms.saturating_sub(ttls.sent_ttl_ms) {
                                remove_sent.push(k.value());
                            }
                        }
                        EntryStatus::Failed => {
                            let failed_at = record
                                .last_attempt_at_ms
                                .unwrap_or(record.first_queued_at_ms);
                            if failed_at <= now_ms.saturating_sub(ttls.failed_ttl_ms) {
                                remove_failed.push(k.value());
                            }
                        }
                        EntryStatus::Pending | EntryStatus::InFlight => {}
                    }
                }
                for queue_id in &remove_sent {
                    entries.remove(*queue_id).map_err(write_err)?;
                }
                for queue_id in &remove_failed {
                    entries.remove(*queue_id).map_err(write_err)?;
                }
                report.sent_removed = remove_sent.len() as u64;
                report.failed_removed = remove_failed.len() as u64;

                let mut dedup = txn.open_table(DEDUP).map_err(txn_err)?;
                let mut stale: Vec<String> = Vec::new();
                for item in dedup.iter().map_err(read_err)? {
                    let (k, v) = item.map_err(read_err)?;
                    if v.value() <= now_ms.saturating_sub(ttls.dedup_ttl_ms) {
                        stale.push(k.value().to_owned());
                    }
                }
                for key in &stale {
                    dedup.remove(key.as_str()).map_err(write_err)?;
                }
                report.dedup_pruned = stale.len() as u64;
            }
            txn.commit().map_err(txn_err)?;
            Ok(report)
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn recover(&self, now_ms: i64) -> Result<u64, StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(txn_err)?;
            let mut reset: u64 = 0;
            {
                let mut entries = txn.open_table(ENTRIES).map_err(txn_err)?;
                let mut expired: Vec<(u64, StoredRecord)> = Vec::new();
                for item in entries.iter().map_err(read_err)? {
                    let (k, v) = item.map_err(read_err)?;
                    let record = decode(k.value(), v.value())?;
                    if record.status == EntryStatus::InFlight
                        && record
                            .lease_expires_at_ms
                            .is_none_or(|deadline| deadline <= now_ms)
                    {
                        expired.push((k.value(), record));
                    }
                }
                for (queue_id, mut record) in expired {
                    record.status = EntryStatus::Pending;
                    record.lease_expires_at_ms = None;
                    let bytes = encode(queue_id, &record)?;
                    entries
                        .insert(queue_id, bytes.as_slice())
                        .map_err(write_err)?;
                    reset = reset.saturating_add(1);
                }
            }
            txn.commit().map_err(txn_err)?;
            Ok(reset)
        })
        .await
        .map_err(|e| StorageError::Write {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn recent_events(
        &self,
        limit: usize,
        cursor: Option<u64>,
        since_ms: Option<i64>,
    ) -> Result<EventPage, StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_read().map_err(txn_err)?;
            let entries = txn.open_table(ENTRIES).map_err(txn_err)?;

            let upper = cursor.unwrap_or(u64::MAX);
            let mut page: Vec<QueueEntry> = Vec::new();
            for item in entries.range(..upper).map_err(read_err)?.rev() {
                let (k, v) = item.map_err(read_err)?;
                if page.len() >= limit {
                    break;
                }
                let record = decode(k.value(), v.value())?;
                if let Some(since) = since_ms {
                    if record.event.timestamp_ms < since {
                        continue;
                    }
                }
                page.push(record.into_entry(k.value()));
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
        })
        .await
        .map_err(|e| StorageError::Read {
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}
