//! Device identity and the credential store.
//!
//! The identity — `(device_id, device_key, key_version)` plus pairing
//! metadata — is the Bridge's credential for the cloud. It lives in the
//! credential store and nowhere else: the platform keychain when one is
//! available, otherwise an encrypted file at a per-machine path readable by
//! a service account. The encryption key for the fallback file is derived
//! from the machine id, so the file is useless when copied to another host.
//!
//! Older installs kept `device_id` / `device_key` in the config file. Those
//! fields are accepted on read and migrated here on the first write; config
//! writes never contain the key again.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::crypto::{self, EncryptionKey};
use crate::error::IdentityError;

/// The credential issued by the cloud at pairing.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// 32-byte device secret, base64 in serialized form.
    #[serde(with = "key_encoding")]
    pub device_key: Vec<u8>,
    pub key_version: u32,
    pub issued_at: DateTime<Utc>,
    /// The control plane this identity was issued by.
    pub server_url: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("key_version", &self.key_version)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

mod key_encoding {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A synchronous secret storage backend.
///
/// Backends are tried in priority order by the [`CredentialStore`]; all
/// calls run on the blocking thread pool.
pub trait SecretBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Load the stored identity bytes, `None` when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Backend`] when the backend itself fails and
    /// [`IdentityError::Corrupt`] when data exists but cannot be recovered.
    fn load(&self) -> Result<Option<Vec<u8>>, IdentityError>;

    /// Persist identity bytes, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Backend`] on failure.
    fn store(&self, bytes: &[u8]) -> Result<(), IdentityError>;

    /// Remove the stored identity. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Backend`] on failure.
    fn clear(&self) -> Result<(), IdentityError>;
}

/// Platform keychain backend (Secret Service / Keychain / Credential Manager).
pub struct KeyringBackend {
    service: String,
    user: String,
}

impl KeyringBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            service: "gym-bridge".to_owned(),
            user: "device-identity".to_owned(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, IdentityError> {
        keyring::Entry::new(&self.service, &self.user).map_err(|e| IdentityError::Backend {
            name: "keyring".to_owned(),
            reason: e.to_string(),
        })
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretBackend for KeyringBackend {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn load(&self) -> Result<Option<Vec<u8>>, IdentityError> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value.into_bytes())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(IdentityError::Backend {
                name: "keyring".to_owned(),
                reason: e.to_string(),
            }),
        }
    }

    fn store(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        let value = String::from_utf8(bytes.to_vec()).map_err(|e| IdentityError::Serialization {
            reason: e.to_string(),
        })?;
        self.entry()?
            .set_password(&value)
            .map_err(|e| IdentityError::Backend {
                name: "keyring".to_owned(),
                reason: e.to_string(),
            })
    }

    fn clear(&self) -> Result<(), IdentityError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(IdentityError::Backend {
                name: "keyring".to_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Encrypted-file fallback backend.
///
/// The file lives at a per-machine path (not per-user) so a background
/// service account can read it, with `0600` permissions on Unix. Contents
/// are AES-256-GCM under a machine-bound key.
pub struct EncryptedFileBackend {
    path: PathBuf,
    key: EncryptionKey,
}

impl EncryptedFileBackend {
    /// Backend at the well-known per-machine path with the machine-bound key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Crypto`] if key derivation fails.
    pub fn machine_bound() -> Result<Self, IdentityError> {
        Ok(Self {
            path: default_identity_path(),
            key: machine_bound_key()?,
        })
    }

    /// Backend at an explicit path with an explicit key (tests, overrides).
    #[must_use]
    pub fn at(path: impl Into<PathBuf>, key: EncryptionKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretBackend for EncryptedFileBackend {
    fn name(&self) -> &'static str {
        "encrypted-file"
    }

    fn load(&self) -> Result<Option<Vec<u8>>, IdentityError> {
        let sealed = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(IdentityError::Backend {
                    name: "encrypted-file".to_owned(),
                    reason: format!("read '{}': {e}", self.path.display()),
                });
            }
        };
        // The file exists; failure to open it means corruption, which is
        // fatal rather than silently treated as unpaired.
        crypto::decrypt(&self.key, &sealed)
            .map(Some)
            .map_err(|e| IdentityError::Corrupt {
                reason: format!("identity file '{}': {e}", self.path.display()),
            })
    }

    fn store(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::Backend {
                name: "encrypted-file".to_owned(),
                reason: format!("create '{}': {e}", parent.display()),
            })?;
        }
        let sealed = crypto::encrypt(&self.key, bytes)?;
        std::fs::write(&self.path, &sealed).map_err(|e| IdentityError::Backend {
            name: "encrypted-file".to_owned(),
            reason: format!("write '{}': {e}", self.path.display()),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).map_err(
                |e| IdentityError::Backend {
                    name: "encrypted-file".to_owned(),
                    reason: format!("chmod '{}': {e}", self.path.display()),
                },
            )?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), IdentityError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IdentityError::Backend {
                name: "encrypted-file".to_owned(),
                reason: format!("remove '{}': {e}", self.path.display()),
            }),
        }
    }
}

/// The well-known per-machine identity file path.
#[must_use]
pub fn default_identity_path() -> PathBuf {
    #[cfg(unix)]
    {
        PathBuf::from("/var/lib/gym-bridge/identity.enc")
    }
    #[cfg(not(unix))]
    {
        let base = std::env::var("ProgramData").unwrap_or_else(|_| "data".to_owned());
        Path::new(&base).join("GymBridge").join("identity.enc")
    }
}

/// Derive the machine-bound encryption key for the fallback file.
///
/// # Errors
///
/// Returns [`IdentityError::Crypto`] if derivation fails.
pub fn machine_bound_key() -> Result<EncryptionKey, IdentityError> {
    let id = machine_id();
    Ok(crypto::derive_key(id.as_bytes(), "identity-file")?)
}

/// A stable identifier for this host. Best-effort but deterministic: the
/// systemd machine id where present, falling back to the hostname.
fn machine_id() -> String {
    #[cfg(unix)]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_owned();
                }
            }
        }
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| "unknown-machine".to_owned())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown-machine".to_owned())
    }
}

/// Priority-ordered credential store over the available backends.
pub struct CredentialStore {
    backends: Arc<Vec<Box<dyn SecretBackend>>>,
}

impl CredentialStore {
    /// The production store: platform keychain first, encrypted file second.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Crypto`] if the machine-bound key cannot be
    /// derived.
    pub fn new() -> Result<Self, IdentityError> {
        Ok(Self::with_backends(vec![
            Box::new(KeyringBackend::new()),
            Box::new(EncryptedFileBackend::machine_bound()?),
        ]))
    }

    /// A store over explicit backends (tests).
    #[must_use]
    pub fn with_backends(backends: Vec<Box<dyn SecretBackend>>) -> Self {
        Self {
            backends: Arc::new(backends),
        }
    }

    /// Load the identity from the first backend that has one.
    ///
    /// Backend failures are logged and the next backend is tried; corrupt
    /// data is fatal and surfaced immediately.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::Corrupt`] if stored data cannot be recovered.
    /// - [`IdentityError::Backend`] if every backend fails outright.
    pub async fn get(&self) -> Result<Option<DeviceIdentity>, IdentityError> {
        let backends = Arc::clone(&self.backends);
        tokio::task::spawn_blocking(move || {
            let mut last_err: Option<IdentityError> = None;
            let mut failures = 0usize;
            for backend in backends.iter() {
                match backend.load() {
                    Ok(Some(bytes)) => {
                        let identity: DeviceIdentity = serde_json::from_slice(&bytes)
                            .map_err(|e| IdentityError::Corrupt {
                                reason: format!("stored identity unparseable: {e}"),
                            })?;
                        return Ok(Some(identity));
                    }
                    Ok(None) => {}
                    Err(corrupt @ IdentityError::Corrupt { .. }) => return Err(corrupt),
                    Err(e) => {
                        tracing::warn!(backend = backend.name(), error = %e, "credential backend unavailable");
                        failures += 1;
                        last_err = Some(e);
                    }
                }
            }
            // A backend reporting "nothing stored" means unpaired; only when
            // every backend errored is the store itself unreadable.
            match last_err {
                Some(e) if failures == backends.len() => Err(e),
                _ => Ok(None),
            }
        })
        .await
        .map_err(|e| IdentityError::Backend {
            name: "credential-store".to_owned(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    /// Persist the identity to the highest-priority backend that accepts it.
    ///
    /// # Errors
    ///
    /// Returns the last backend error if none succeeds.
    pub async fn set(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
        let bytes = serde_json::to_vec(identity).map_err(|e| IdentityError::Serialization {
            reason: e.to_string(),
        })?;
        let backends = Arc::clone(&self.backends);
        tokio::task::spawn_blocking(move || {
            let mut last_err = IdentityError::Backend {
                name: "credential-store".to_owned(),
                reason: "no backends configured".to_owned(),
            };
            for backend in backends.iter() {
                match backend.store(&bytes) {
                    Ok(()) => {
                        tracing::info!(backend = backend.name(), "device identity stored");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(backend = backend.name(), error = %e, "credential backend rejected write");
                        last_err = e;
                    }
                }
            }
            Err(last_err)
        })
        .await
        .map_err(|e| IdentityError::Backend {
            name: "credential-store".to_owned(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    /// Remove the identity from every backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend error encountered, after trying all.
    pub async fn clear(&self) -> Result<(), IdentityError> {
        let backends = Arc::clone(&self.backends);
        tokio::task::spawn_blocking(move || {
            let mut first_err = None;
            for backend in backends.iter() {
                if let Err(e) = backend.clear() {
                    tracing::warn!(backend = backend.name(), error = %e, "credential clear failed");
                    first_err.get_or_insert(e);
                }
            }
            first_err.map_or(Ok(()), Err)
        })
        .await
        .map_err(|e| IdentityError::Backend {
            name: "credential-store".to_owned(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    /// Resolve the identity at startup: the store is the source of truth,
    /// with a one-time migration of legacy config fields.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::Corrupt`] for unrecoverable stored or legacy data.
    /// - [`IdentityError::Backend`] if the store cannot be read or written.
    pub async fn resolve(
        &self,
        config: &BridgeConfig,
    ) -> Result<Option<DeviceIdentity>, IdentityError> {
        if let Some(identity) = self.get().await? {
            return Ok(Some(identity));
        }

        // Legacy path: identity embedded in the config file. Migrate it into
        // the store; the config save path drops the fields.
        let (Some(device_id), Some(device_key_hex)) = (&config.device_id, &config.device_key)
        else {
            return Ok(None);
        };
        let device_key = hex::decode(device_key_hex).map_err(|e| IdentityError::Corrupt {
            reason: format!("legacy device_key in config is not hex: {e}"),
        })?;
        if device_key.len() != 32 {
            return Err(IdentityError::Corrupt {
                reason: format!(
                    "legacy device_key in config must be 32 bytes, got {}",
                    device_key.len()
                ),
            });
        }

        let identity = DeviceIdentity {
            device_id: device_id.clone(),
            device_key,
            key_version: 1,
            issued_at: Utc::now(),
            server_url: config.server_url.clone(),
        };
        self.set(&identity).await?;
        tracing::info!(device_id = %identity.device_id, "migrated legacy config identity into the credential store");
        Ok(Some(identity))
    }
}
