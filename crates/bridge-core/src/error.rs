//! Error types for `bridge-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Key material never appears in error messages — only key
//! versions, ids, or operation descriptions. Components return these typed
//! errors to their caller; only the supervisor decides what is fatal.

use bridge_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from loading, validating, or persisting configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config io error at '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The config document is not valid YAML.
    #[error("config parse error: {reason}")]
    Parse { reason: String },

    /// A key that no Bridge option recognizes (absent `--permissive`).
    #[error("unknown config key '{key}' — remove it or run with --permissive")]
    UnknownKey { key: String },

    /// The config parsed but a value is out of bounds or inconsistent.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// Errors from the device identity and its credential store.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No identity has been provisioned — the Bridge is unpaired.
    #[error("device identity missing — pair this bridge with `bridge pair`")]
    Missing,

    /// Stored identity exists but cannot be decrypted or parsed. Fatal;
    /// the operator must re-pair or restore the credential store.
    #[error("device identity corrupt: {reason}")]
    Corrupt { reason: String },

    /// A credential-store backend failed.
    #[error("credential store backend '{name}' failed: {reason}")]
    Backend { name: String, reason: String },

    /// The identity could not be serialized for storage.
    #[error("identity serialization failed: {reason}")]
    Serialization { reason: String },

    /// A cryptographic operation on the fallback file failed.
    #[error("identity crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors from request signing, verification, and key rotation.
///
/// Never fatal on their own — the cloud client runs a rotation probe and
/// surfaces the result.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The cloud rejected the request's credentials.
    #[error("unauthenticated: {reason}")]
    Unauthenticated { reason: String },

    /// The request timestamp is outside the accepted window.
    #[error("clock skew of {offset_secs}s exceeds the {limit_secs}s window — check NTP on this host")]
    ClockSkew { offset_secs: i64, limit_secs: i64 },

    /// A response signature did not verify.
    #[error("response signature verification failed")]
    InvalidSignature,

    /// Key rotation did not complete; the previous key remains active.
    #[error("key rotation to version {key_version} failed: {reason}")]
    RotationFailed { key_version: u32, reason: String },

    /// A key envelope could not be opened.
    #[error("key envelope invalid: {reason}")]
    Envelope { reason: String },
}

/// Errors from the durable queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity and every entry is in-flight. Adapters must
    /// drop the event and count it, not crash.
    #[error("queue full: all entries in-flight, nothing evictable")]
    Full,

    /// The backing store is unreadable. Fatal — the operator must inspect
    /// or remove the database file.
    #[error("queue store corrupt at '{path}': {reason}")]
    Corrupt { path: String, reason: String },

    /// The storage layer failed.
    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sealing or unsealing an event payload failed.
    #[error("queue crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The dead-letter log could not be written.
    #[error("dead-letter write failed: {reason}")]
    DeadLetter { reason: String },

    /// An event payload could not be serialized or parsed back.
    #[error("payload serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the event processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The raw event failed validation and was dropped.
    #[error("invalid event from adapter '{adapter}': {reason}")]
    Invalid { adapter: String, reason: String },

    /// The queue rejected the event.
    #[error("processor queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors from handling a cloud command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command type is not one this Bridge understands.
    #[error("unknown command type '{kind}'")]
    UnknownCommand { kind: String },

    /// No running adapter advertises the door-unlock capability.
    #[error("no door-capable adapter is running")]
    NoDoorAdapter,

    /// The adapter accepted the unlock call but reported failure.
    #[error("unlock via adapter '{adapter}' failed: {reason}")]
    Unlock { adapter: String, reason: String },

    /// The command id was seen recently — replay rejected.
    #[error("command '{command_id}' already executed")]
    Replay { command_id: String },
}
