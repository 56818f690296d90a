//! Bridge configuration: a single YAML document plus `BRIDGE_*` environment
//! overrides.
//!
//! Keys are snake_case; camelCase keys from older installs are normalized on
//! read. Environment overrides use the `BRIDGE_` prefix with `__` separating
//! nesting levels (`BRIDGE_API_SERVER__PORT=9090`), so underscores inside a
//! key survive (`BRIDGE_QUEUE_MAX_SIZE=5000`).
//!
//! Unknown keys in the file are refused unless the process runs with
//! `--permissive`. A loaded config is published as an immutable snapshot;
//! hot reload swaps the snapshot, it never mutates in place. `server_url`
//! and storage paths cannot change across a reload.
//!
//! The `device_id` / `device_key` fields are a backward-compatibility shim:
//! accepted on read so old installs keep working, migrated into the
//! credential store on the next identity write, and never written back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tier::Tier;

/// Process-wide configuration, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the cloud control plane. Not hot-reloadable.
    pub server_url: String,
    /// Fixed tier, or `auto` to derive from sampled resources.
    pub tier: TierSetting,
    /// Maximum `pending + in-flight` entries retained by the queue.
    pub queue_max_size: u64,
    /// Heartbeat period override in seconds; `None` follows the tier.
    pub heartbeat_interval: Option<u64>,
    /// How long a door stays unlocked, in milliseconds.
    pub unlock_duration_ms: u64,
    /// Path of the embedded queue database. Not hot-reloadable.
    pub database_path: PathBuf,
    /// Log filter (e.g. `info`, `debug`, `bridge_core=trace`).
    pub log_level: String,
    /// When set, logs are written to this file instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Adapters to bring up, in start order.
    pub enabled_adapters: Vec<String>,
    /// Per-adapter opaque configuration, keyed by adapter name.
    pub adapter_configs: HashMap<String, serde_json::Value>,
    pub api_server: ApiServerConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub submit: SubmitConfig,
    /// Legacy identity fields — read for migration, never written back.
    #[serde(skip_serializing)]
    pub device_id: Option<String>,
    #[serde(skip_serializing)]
    pub device_key: Option<String>,
}

/// `tier` option: a fixed tier or automatic selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSetting {
    Auto,
    Lite,
    Normal,
    Full,
}

impl TierSetting {
    /// The pinned tier, if this setting is not `auto`.
    #[must_use]
    pub fn fixed(self) -> Option<Tier> {
        match self {
            Self::Auto => None,
            Self::Lite => Some(Tier::Lite),
            Self::Normal => Some(Tier::Normal),
            Self::Full => Some(Tier::Full),
        }
    }
}

/// Local control API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub auth: ApiAuthConfig,
    /// Explicit CORS origin allowlist; empty means no cross-origin access.
    pub cors_origins: Vec<String>,
}

/// Optional HMAC auth for the local API, with a locally provisioned key
/// separate from the cloud device key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiAuthConfig {
    pub enabled: bool,
    /// Hex-encoded local API key. Required when `enabled`.
    pub key: Option<String>,
}

/// Retry/backoff policy shared by submission and adapter restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

/// Duplicate-suppression window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    pub window_seconds: u64,
}

/// Submission shaping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmitConfig {
    /// Batch size override; `None` follows the tier (10 / 50 / 100).
    pub batch_size: Option<u32>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_url: "https://api.gymtrack.io".to_owned(),
            tier: TierSetting::Auto,
            queue_max_size: 10_000,
            heartbeat_interval: None,
            unlock_duration_ms: 3_000,
            database_path: PathBuf::from("data/bridge.db"),
            log_level: "info".to_owned(),
            log_file: None,
            enabled_adapters: vec!["simulator".to_owned()],
            adapter_configs: HashMap::new(),
            api_server: ApiServerConfig::default(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            submit: SubmitConfig::default(),
            device_id: None,
            device_key: None,
        }
    }
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_owned(),
            port: 8081,
            auth: ApiAuthConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for ApiAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            max_attempts: 10,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_seconds: 300,
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self { batch_size: None }
    }
}

impl BridgeConfig {
    /// Load configuration: defaults, then the YAML file (if given), then
    /// `BRIDGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Io`] / [`ConfigError::Parse`] for unreadable or
    ///   malformed files.
    /// - [`ConfigError::UnknownKey`] for unrecognized keys unless
    ///   `permissive`.
    /// - [`ConfigError::Invalid`] for out-of-bounds or inconsistent values.
    pub fn load(path: Option<&Path>, permissive: bool) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&Self::default()).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?,
        );

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let normalized = normalize_document(&raw, permissive)?;
            if !normalized.is_empty() {
                builder = builder.add_source(File::from_str(&normalized, FileFormat::Yaml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("enabled_adapters")
                .with_list_parse_key("api_server.cors_origins"),
        );

        let cfg: Self = builder
            .build()
            .map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Persist the configuration as YAML. Identity fields are never written.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(path, yaml).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Validate values and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                reason: format!("server_url must be http(s), got '{}'", self.server_url),
            });
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Invalid {
                reason: "queue_max_size must be at least 1".to_owned(),
            });
        }
        if self.retry.base_ms == 0 || self.retry.base_ms > self.retry.max_ms {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "retry.base_ms ({}) must be non-zero and <= retry.max_ms ({})",
                    self.retry.base_ms, self.retry.max_ms
                ),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "retry.max_attempts must be at least 1".to_owned(),
            });
        }
        if self.dedup.window_seconds == 0 {
            return Err(ConfigError::Invalid {
                reason: "dedup.window_seconds must be at least 1".to_owned(),
            });
        }
        if let Some(batch) = self.submit.batch_size {
            if batch == 0 {
                return Err(ConfigError::Invalid {
                    reason: "submit.batch_size must be at least 1".to_owned(),
                });
            }
        }
        if self.api_server.enabled && self.api_server.port == 0 {
            return Err(ConfigError::Invalid {
                reason: "api_server.port must be non-zero when the API is enabled".to_owned(),
            });
        }
        if self.api_server.auth.enabled {
            let key_ok = self
                .api_server
                .auth
                .key
                .as_deref()
                .is_some_and(|k| !k.is_empty() && hex::decode(k).is_ok());
            if !key_ok {
                return Err(ConfigError::Invalid {
                    reason: "api_server.auth.key must be a hex string when auth is enabled"
                        .to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Refuse reloads that change options fixed for the process lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the frozen option.
    pub fn ensure_reloadable_from(&self, old: &Self) -> Result<(), ConfigError> {
        if self.server_url != old.server_url {
            return Err(ConfigError::Invalid {
                reason: "server_url cannot change without a restart".to_owned(),
            });
        }
        if self.database_path != old.database_path {
            return Err(ConfigError::Invalid {
                reason: "database_path cannot change without a restart".to_owned(),
            });
        }
        if self.log_file != old.log_file {
            return Err(ConfigError::Invalid {
                reason: "log_file cannot change without a restart".to_owned(),
            });
        }
        Ok(())
    }
}

/// Normalize a YAML document: convert camelCase keys from older installs to
/// snake_case and, unless `permissive`, refuse keys no option recognizes.
fn normalize_document(raw: &str, permissive: bool) -> Result<String, ConfigError> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;
    if value.is_null() {
        return Ok(String::new());
    }

    let normalized = normalize_value(value, &[]);
    if !permissive {
        check_known_keys(&normalized, &[])?;
    }
    serde_yaml::to_string(&normalized).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recursively snake_case mapping keys. The values under `adapter_configs`
/// are vendor-opaque and left untouched (one level below the adapter name).
fn normalize_value(value: serde_yaml::Value, path: &[String]) -> serde_yaml::Value {
    let opaque = path.first().is_some_and(|head| head == "adapter_configs") && path.len() >= 2;
    match value {
        serde_yaml::Value::Mapping(map) if !opaque => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (k, v) in map {
                let key = match &k {
                    serde_yaml::Value::String(s) => snake_case(s),
                    other => {
                        out.insert(other.clone(), v);
                        continue;
                    }
                };
                let mut child_path = path.to_vec();
                child_path.push(key.clone());
                out.insert(
                    serde_yaml::Value::String(key),
                    normalize_value(v, &child_path),
                );
            }
            serde_yaml::Value::Mapping(out)
        }
        other => other,
    }
}

/// The recognized key tree. `None` children mean "leaf or opaque subtree".
fn known_children(path: &[String]) -> Option<&'static [&'static str]> {
    match path {
        [] => Some(&[
            "server_url",
            "tier",
            "queue_max_size",
            "heartbeat_interval",
            "unlock_duration_ms",
            "database_path",
            "log_level",
            "log_file",
            "enabled_adapters",
            "adapter_configs",
            "api_server",
            "retry",
            "dedup",
            "submit",
            "device_id",
            "device_key",
        ]),
        [head] if head == "api_server" => {
            Some(&["enabled", "host", "port", "auth", "cors_origins"])
        }
        [a, b] if a == "api_server" && b == "auth" => Some(&["enabled", "key"]),
        [head] if head == "retry" => Some(&["base_ms", "max_ms", "max_attempts"]),
        [head] if head == "dedup" => Some(&["window_seconds"]),
        [head] if head == "submit" => Some(&["batch_size"]),
        _ => None,
    }
}

fn check_known_keys(value: &serde_yaml::Value, path: &[String]) -> Result<(), ConfigError> {
    let Some(allowed) = known_children(path) else {
        return Ok(());
    };
    let serde_yaml::Value::Mapping(map) = value else {
        return Ok(());
    };
    for (k, v) in map {
        let serde_yaml::Value::String(key) = k else {
            continue;
        };
        if !allowed.contains(&key.as_str()) {
            let full = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{key}", path.join("."))
            };
            return Err(ConfigError::UnknownKey { key: full });
        }
        // adapter_configs children are adapter names, not fixed keys.
        if path.is_empty() && key == "adapter_configs" {
            continue;
        }
        let mut child_path = path.to_vec();
        child_path.push(key.clone());
        check_known_keys(v, &child_path)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn loads_snake_case_document() {
        let file = write_config(
            "server_url: \"http://localhost:9000\"\n\
             queue_max_size: 500\n\
             enabled_adapters:\n  - simulator\n  - zkteco\n\
             retry:\n  base_ms: 250\n  max_ms: 8000\n",
        );
        let cfg = BridgeConfig::load(Some(file.path()), false).unwrap();
        assert_eq!(cfg.server_url, "http://localhost:9000");
        assert_eq!(cfg.queue_max_size, 500);
        assert_eq!(cfg.enabled_adapters, vec!["simulator", "zkteco"]);
        assert_eq!(cfg.retry.base_ms, 250);
        // Untouched options keep their defaults.
        assert_eq!(cfg.dedup.window_seconds, 300);
    }

    #[test]
    fn accepts_camel_case_keys_from_older_installs() {
        let file = write_config(
            "serverUrl: \"http://localhost:9000\"\n\
             queueMaxSize: 42\n\
             unlockDurationMs: 5000\n\
             apiServer:\n  port: 9999\n",
        );
        let cfg = BridgeConfig::load(Some(file.path()), false).unwrap();
        assert_eq!(cfg.queue_max_size, 42);
        assert_eq!(cfg.unlock_duration_ms, 5_000);
        assert_eq!(cfg.api_server.port, 9_999);
    }

    #[test]
    fn unknown_key_is_refused() {
        let file = write_config("definitely_not_an_option: 1\n");
        let err = BridgeConfig::load(Some(file.path()), false).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { key } if key == "definitely_not_an_option"));
    }

    #[test]
    fn unknown_nested_key_names_the_full_path() {
        let file = write_config("retry:\n  base_ms: 100\n  turbo: true\n");
        let err = BridgeConfig::load(Some(file.path()), false).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { key } if key == "retry.turbo"));
    }

    #[test]
    fn permissive_mode_ignores_unknown_keys() {
        let file = write_config("definitely_not_an_option: 1\nqueue_max_size: 7\n");
        let cfg = BridgeConfig::load(Some(file.path()), true).unwrap();
        assert_eq!(cfg.queue_max_size, 7);
    }

    #[test]
    fn adapter_configs_are_opaque() {
        let file = write_config(
            "adapter_configs:\n  zkteco:\n    deviceIp: \"10.0.0.5\"\n    commPassword: 0\n",
        );
        let cfg = BridgeConfig::load(Some(file.path()), false).unwrap();
        let zk = cfg.adapter_configs.get("zkteco").unwrap();
        // Vendor keys keep their original casing.
        assert_eq!(zk["deviceIp"], "10.0.0.5");
    }

    #[test]
    fn legacy_identity_fields_load_but_never_save() {
        let file = write_config("device_id: dev_old\ndevice_key: aabbcc\n");
        let cfg = BridgeConfig::load(Some(file.path()), false).unwrap();
        assert_eq!(cfg.device_id.as_deref(), Some("dev_old"));

        let out = tempfile::tempdir().unwrap();
        let out_path = out.path().join("config.yaml");
        cfg.save(&out_path).unwrap();
        let written = std::fs::read_to_string(&out_path).unwrap();
        assert!(!written.contains("device_key"));
        assert!(!written.contains("aabbcc"));
    }

    #[test]
    fn invalid_retry_bounds_are_rejected() {
        let file = write_config("retry:\n  base_ms: 9000\n  max_ms: 100\n");
        let err = BridgeConfig::load(Some(file.path()), false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn auth_enabled_requires_hex_key() {
        let file = write_config("api_server:\n  auth:\n    enabled: true\n    key: \"zz-not-hex\"\n");
        let err = BridgeConfig::load(Some(file.path()), false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn reload_cannot_change_frozen_options() {
        let old = BridgeConfig::default();
        let mut next = old.clone();
        next.queue_max_size = 99;
        next.ensure_reloadable_from(&old).unwrap();

        next.server_url = "http://elsewhere:1".to_owned();
        assert!(next.ensure_reloadable_from(&old).is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut cfg = BridgeConfig::default();
        cfg.queue_max_size = 1234;
        cfg.enabled_adapters = vec!["zkteco".to_owned()];
        cfg.save(&path).unwrap();

        let back = BridgeConfig::load(Some(&path), false).unwrap();
        assert_eq!(back.queue_max_size, 1234);
        assert_eq!(back.enabled_adapters, vec!["zkteco"]);
    }
}
