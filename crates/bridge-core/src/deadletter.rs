//! Dead-letter log for evicted events.
//!
//! Appends JSON-lines entries to `deadletter.jsonl` next to the queue
//! database. Each line is one evicted event: enough cleartext metadata to
//! identify it plus the still-sealed payload, base64-encoded. The file is
//! opened in append-only mode — nothing is ever updated or deleted here.
//!
//! A `tokio::sync::Mutex` serializes writes; evictions are rare relative to
//! event throughput and the critical section is one `write_all`.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use bridge_storage::QueueEntry;

use crate::error::QueueError;

/// One dead-lettered event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub evicted_at: DateTime<Utc>,
    pub queue_id: u64,
    pub event_id: String,
    pub device_id: String,
    pub external_user_id: String,
    /// Original event time, ms since the Unix epoch.
    pub timestamp_ms: i64,
    pub event_type: String,
    pub is_simulated: bool,
    pub retry_count: u32,
    /// The sealed payload as it sat in the queue, base64.
    pub payload: String,
}

impl DeadLetterEntry {
    /// Build a dead-letter record from an evicted queue entry.
    #[must_use]
    pub fn from_evicted(entry: &QueueEntry, evicted_at: DateTime<Utc>) -> Self {
        Self {
            evicted_at,
            queue_id: entry.queue_id,
            event_id: entry.event.event_id.clone(),
            device_id: entry.event.device_id.clone(),
            external_user_id: entry.event.external_user_id.clone(),
            timestamp_ms: entry.event.timestamp_ms,
            event_type: entry.event.event_type.clone(),
            is_simulated: entry.event.is_simulated,
            retry_count: entry.retry_count,
            payload: BASE64.encode(&entry.event.payload),
        }
    }
}

/// Append-only JSON-lines log of evicted events.
pub struct DeadLetterLog {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl DeadLetterLog {
    /// Create a log writing to the given path. The file is created lazily on
    /// the first eviction.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DeadLetter`] if the line cannot be written.
    pub async fn append(&self, entry: &DeadLetterEntry) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| QueueError::DeadLetter {
            reason: format!("serialize: {e}"),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| QueueError::DeadLetter {
                        reason: format!("create '{}': {e}", parent.display()),
                    })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| QueueError::DeadLetter {
                    reason: format!("open '{}': {e}", self.path.display()),
                })?;
            *guard = Some(file);
        }

        let file = guard.as_mut().ok_or_else(|| QueueError::DeadLetter {
            reason: "file handle unexpectedly None after open".to_owned(),
        })?;
        file.write_all(&line)
            .await
            .map_err(|e| QueueError::DeadLetter {
                reason: format!("write: {e}"),
            })?;
        file.flush().await.map_err(|e| QueueError::DeadLetter {
            reason: format!("flush: {e}"),
        })?;
        Ok(())
    }

    /// Read the last `limit` entries, oldest first. Unparseable lines are
    /// skipped — the log may contain lines from older versions.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DeadLetter`] if the file cannot be read.
    pub async fn tail(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(QueueError::DeadLetter {
                    reason: format!("read '{}': {e}", self.path.display()),
                });
            }
        };

        let parsed: Vec<DeadLetterEntry> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = parsed.len().saturating_sub(limit);
        Ok(parsed.into_iter().skip(skip).collect())
    }
}

impl std::fmt::Debug for DeadLetterLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bridge_storage::{EntryStatus, EventRecord};

    fn entry(queue_id: u64, event_id: &str) -> QueueEntry {
        QueueEntry {
            queue_id,
            status: EntryStatus::Pending,
            retry_count: 0,
            first_queued_at_ms: 1_000,
            last_attempt_at_ms: None,
            sent_at_ms: None,
            lease_expires_at_ms: None,
            event: EventRecord {
                event_id: event_id.to_owned(),
                device_id: "dev_x".to_owned(),
                external_user_id: "u1".to_owned(),
                timestamp_ms: 1_000,
                event_type: "entry".to_owned(),
                is_simulated: false,
                payload: b"sealed".to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn append_and_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("deadletter.jsonl"));

        for i in 0..5u64 {
            let record = DeadLetterEntry::from_evicted(&entry(i, &format!("e{i}")), Utc::now());
            log.append(&record).await.unwrap();
        }

        let tail = log.tail(3).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].event_id, "e2");
        assert_eq!(tail[2].event_id, "e4");
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("deadletter.jsonl"));
        assert!(log.tail(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lines_are_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deadletter.jsonl");
        let log = DeadLetterLog::new(&path);
        log.append(&DeadLetterEntry::from_evicted(&entry(1, "e1"), Utc::now()))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        for line in contents.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["event_id"], "e1");
        }
    }
}
