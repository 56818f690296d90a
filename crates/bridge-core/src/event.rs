//! The event model: what adapters emit, what the pipeline stores and ships.
//!
//! A [`RawHardwareEvent`] is whatever a vendor device produced, normalized
//! just enough to carry. The processor turns it into a [`StandardEvent`] —
//! canonical, enriched, and carrying a deterministic [`event id`](event_id)
//! whose construction is what makes deduplication cheap: the wall-clock
//! timestamp is floored to the dedup window before hashing, so two reads of
//! the same card in the same window collide on the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical access-event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A member entered.
    Entry,
    /// A member left.
    Exit,
    /// Access was denied at the device.
    Denied,
}

impl EventType {
    /// The canonical wire string for this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::Denied => "denied",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Self::Entry),
            "exit" => Ok(Self::Exit),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

/// What a hardware adapter emits, before processing.
///
/// Produced by an adapter, consumed exactly once by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHardwareEvent {
    /// Vendor-scoped user identifier (fingerprint template id, card number).
    pub external_user_id: String,
    /// Wall-clock UTC time of the event, millisecond resolution.
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Opaque vendor-specific fields, carried through unmodified.
    #[serde(default)]
    pub raw_data: serde_json::Map<String, serde_json::Value>,
    /// Name of the adapter that produced this event.
    pub adapter_name: String,
}

/// The canonical, deduplicated event after processing.
///
/// Created by the processor, retained by the queue until the cloud accepts
/// it or it is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardEvent {
    /// Deterministic 128-bit hex id; unique across the system.
    pub event_id: String,
    pub device_id: String,
    pub external_user_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub is_simulated: bool,
    /// Vendor payload; sealed at rest by the queue.
    #[serde(default)]
    pub raw_data: serde_json::Map<String, serde_json::Value>,
}

/// Compute the deterministic event id for a dedup bucket.
///
/// `SHA-256(device_id || external_user_id || event_type || bucket)`,
/// truncated to the first 128 bits, hex-encoded. The bucket is
/// `floor(unix_seconds / dedup_window_secs)`.
#[must_use]
fn event_id_at_bucket(
    device_id: &str,
    external_user_id: &str,
    event_type: EventType,
    bucket: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(external_user_id.as_bytes());
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Compute the event id for an event at `timestamp`.
#[must_use]
pub fn event_id(
    device_id: &str,
    external_user_id: &str,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    dedup_window_secs: i64,
) -> String {
    let window = dedup_window_secs.max(1);
    let bucket = timestamp.timestamp().div_euclid(window);
    event_id_at_bucket(device_id, external_user_id, event_type, bucket)
}

/// The dedup-index keys to probe when admitting an event.
///
/// An earlier duplicate within the window lies either in the same bucket or
/// the previous one, so two probes cover the whole window. The first probe is
/// the event's own id.
#[must_use]
pub fn dedup_probes(
    device_id: &str,
    external_user_id: &str,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    dedup_window_secs: i64,
) -> [String; 2] {
    let window = dedup_window_secs.max(1);
    let bucket = timestamp.timestamp().div_euclid(window);
    [
        event_id_at_bucket(device_id, external_user_id, event_type, bucket),
        event_id_at_bucket(device_id, external_user_id, event_type, bucket - 1),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_id_is_stable() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let a = event_id("dev_x", "u1", EventType::Entry, ts, 300);
        let b = event_id("dev_x", "u1", EventType::Entry, ts, 300);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32); // 128 bits, hex
    }

    #[test]
    fn event_id_collides_within_bucket() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 25, 0).unwrap();
        let later = ts + chrono::Duration::seconds(10);
        assert_eq!(
            event_id("dev_x", "u1", EventType::Entry, ts, 300),
            event_id("dev_x", "u1", EventType::Entry, later, 300),
        );
    }

    #[test]
    fn event_id_differs_across_identity_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 25, 0).unwrap();
        let base = event_id("dev_x", "u1", EventType::Entry, ts, 300);
        assert_ne!(base, event_id("dev_y", "u1", EventType::Entry, ts, 300));
        assert_ne!(base, event_id("dev_x", "u2", EventType::Entry, ts, 300));
        assert_ne!(base, event_id("dev_x", "u1", EventType::Exit, ts, 300));
    }

    #[test]
    fn probes_cover_the_previous_bucket() {
        // 9:25:05 is 5 seconds into a bucket; an event 10 seconds earlier is
        // in the previous bucket and must be reachable through probe[1].
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 9, 25, 5).unwrap();
        let earlier = ts - chrono::Duration::seconds(10);
        let probes = dedup_probes("dev_x", "u1", EventType::Entry, ts, 300);
        let earlier_id = event_id("dev_x", "u1", EventType::Entry, earlier, 300);
        assert_eq!(probes[1], earlier_id);
    }

    #[test]
    fn event_type_round_trips_through_serde() {
        let json = serde_json::to_string(&EventType::Denied).unwrap();
        assert_eq!(json, "\"denied\"");
        let back: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventType::Denied);
    }
}
