//! Durable event-queue storage for the Bridge.
//!
//! This crate defines the [`EventStore`] trait — the transactional storage
//! interface behind the Bridge's durable queue. It knows nothing about
//! hardware adapters, HMAC credentials, or the cloud API; it stores opaque
//! event records with delivery metadata and guarantees that every mutation
//! (enqueue + dedup insert, lease, ack, compaction) is a single transaction.
//!
//! Two implementations are provided:
//!
//! - [`RedbEventStore`] — production default, backed by redb (feature `redb-backend`)
//! - [`MemoryEventStore`] — in-memory, for testing only
//!
//! Payload encryption happens above this layer: the `payload` blob arrives
//! already sealed, while the fields the store filters and orders on
//! (event id, timestamp, status) stay cleartext.

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_store;

pub use error::StorageError;
pub use memory::MemoryEventStore;
#[cfg(feature = "redb-backend")]
pub use redb_store::RedbEventStore;

use serde::{Deserialize, Serialize};

/// A canonical event as the store sees it.
///
/// `payload` is the sealed (encrypted) raw vendor data; the remaining fields
/// are cleartext so the store can deduplicate and order without a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Deterministic 128-bit hex id, unique within the non-evicted set.
    pub event_id: String,
    /// The paired device id (empty while unpaired).
    pub device_id: String,
    /// Vendor-scoped user identifier.
    pub external_user_id: String,
    /// Event wall-clock time, milliseconds since the Unix epoch (UTC).
    pub timestamp_ms: i64,
    /// Canonical event type (`entry`, `exit`, `denied`).
    pub event_type: String,
    /// Whether the event came from the simulator adapter.
    pub is_simulated: bool,
    /// Sealed vendor payload (AES-256-GCM, sealed above this layer).
    pub payload: Vec<u8>,
}

/// Delivery state of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be leased.
    Pending,
    /// Leased by a submission batch; invisible until the lease expires.
    InFlight,
    /// Acknowledged by the cloud; awaiting compaction.
    Sent,
    /// Terminal failure; retained for forensic inspection, never re-sent.
    Failed,
}

/// An event plus its delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic local id; never reused for the lifetime of the store.
    pub queue_id: u64,
    pub status: EntryStatus,
    pub retry_count: u32,
    /// When the entry was first enqueued (ms since epoch).
    pub first_queued_at_ms: i64,
    /// Last lease time, if any.
    pub last_attempt_at_ms: Option<i64>,
    /// When the cloud acknowledged the entry, if it did.
    pub sent_at_ms: Option<i64>,
    /// Lease deadline while `InFlight`.
    pub lease_expires_at_ms: Option<i64>,
    pub event: EventRecord,
}

/// Bounds applied atomically during [`EventStore::enqueue`].
#[derive(Debug, Clone, Copy)]
pub struct EnqueueLimits {
    /// Maximum `pending + in-flight` entries before eviction kicks in.
    pub queue_max_size: u64,
    /// Two events with the same dedup identity closer than this are one event.
    pub dedup_window_ms: i64,
}

/// Result of an [`EventStore::enqueue`] call.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The event was inserted. `evicted` holds the oldest pending entries
    /// removed to stay within `queue_max_size` (dead-lettered by the caller).
    Inserted {
        queue_id: u64,
        evicted: Vec<QueueEntry>,
    },
    /// A matching event already exists within the dedup window.
    Duplicate,
    /// The queue is full and every entry is in-flight — nothing evictable.
    Full,
}

/// Outcome counts of an [`EventStore::ack_failed`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckFailedReport {
    /// Entries returned to `Pending` for another attempt.
    pub requeued: u64,
    /// Entries that hit the terminal `Failed` state.
    pub failed: u64,
}

/// Queue occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    /// Sent entries awaiting compaction.
    pub sent: u64,
    pub failed: u64,
    /// Total serialized size of all retained entries.
    pub total_bytes: u64,
}

/// Retention windows applied by [`EventStore::compact`].
#[derive(Debug, Clone, Copy)]
pub struct CompactionTtls {
    /// Remove `Sent` entries older than this.
    pub sent_ttl_ms: i64,
    /// Remove `Failed` entries older than this.
    pub failed_ttl_ms: i64,
    /// Prune dedup index rows older than this (window + slack).
    pub dedup_ttl_ms: i64,
}

/// What a compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub sent_removed: u64,
    pub failed_removed: u64,
    pub dedup_pruned: u64,
}

/// One page of entries for the local API, newest first.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub entries: Vec<QueueEntry>,
    /// Pass back as `cursor` to fetch the next (older) page.
    pub next_cursor: Option<u64>,
}

/// Transactional storage behind the durable queue.
///
/// Every method is one transaction: either all of its effects are visible
/// after the call or none are, including across process kills. Queue ids are
/// monotonic and never reused; event ids are unique within the non-evicted
/// set.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Insert an event, enforcing dedup and the size bound in the same
    /// transaction.
    ///
    /// `dedup_probes` are the event-id keys to consult in the dedup index
    /// (the event's own id plus any adjacent-bucket ids the caller derives).
    /// A probe hit within `dedup_window_ms` of the event's timestamp makes
    /// the call return [`EnqueueOutcome::Duplicate`] without inserting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn enqueue(
        &self,
        event: EventRecord,
        dedup_probes: &[String],
        limits: EnqueueLimits,
        now_ms: i64,
    ) -> Result<EnqueueOutcome, StorageError>;

    /// Lease up to `max_count` pending entries (oldest first, at most
    /// `max_bytes` of payload), marking them `InFlight` until `now_ms +
    /// lease_ttl_ms`. Entries whose previous lease has expired are leasable
    /// again with their retry count intact.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn lease_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        lease_ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<QueueEntry>, StorageError>;

    /// Mark entries `Sent`, recording `sent_at`. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn ack_sent(&self, queue_ids: &[u64], now_ms: i64) -> Result<(), StorageError>;

    /// Record a failed delivery attempt. Retriable failures below
    /// `max_attempts` go back to `Pending`; everything else becomes the
    /// terminal `Failed` state.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn ack_failed(
        &self,
        queue_ids: &[u64],
        retriable: bool,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<AckFailedReport, StorageError>;

    /// Current occupancy counters.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn stats(&self) -> Result<QueueStats, StorageError>;

    /// Remove aged `Sent`/`Failed` entries and prune the dedup index.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn compact(
        &self,
        ttls: CompactionTtls,
        now_ms: i64,
    ) -> Result<CompactionReport, StorageError>;

    /// Crash recovery: reset `InFlight` entries whose lease expired back to
    /// `Pending` with their retry count unchanged. Returns the reset count.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the transaction fails.
    async fn recover(&self, now_ms: i64) -> Result<u64, StorageError>;

    /// Page through retained entries newest-first for the local API.
    ///
    /// `cursor` is an exclusive upper bound on `queue_id`; `since_ms` filters
    /// out events older than the given timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    async fn recent_events(
        &self,
        limit: usize,
        cursor: Option<u64>,
        since_ms: Option<i64>,
    ) -> Result<EventPage, StorageError>;
}
