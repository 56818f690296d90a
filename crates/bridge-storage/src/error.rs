//! Error type for the storage layer.
//!
//! Each variant carries enough context to diagnose the problem without a
//! debugger. Payload bytes never appear in error messages — only ids,
//! paths, and operation descriptions.

/// Errors from the event store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be opened or created.
    #[error("failed to open event store at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// The store exists but its contents cannot be read back. Fatal for the
    /// process — the operator must inspect or remove the database file.
    #[error("event store at '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// A transaction failed to begin or commit.
    #[error("store transaction failed: {reason}")]
    Transaction { reason: String },

    /// A read inside a transaction failed.
    #[error("store read failed: {reason}")]
    Read { reason: String },

    /// A write inside a transaction failed.
    #[error("store write failed: {reason}")]
    Write { reason: String },

    /// An entry record could not be serialized or deserialized.
    #[error("entry serialization failed for queue id {queue_id}: {reason}")]
    Serialization { queue_id: u64, reason: String },
}
