//! The authenticated cloud client.
//!
//! Every request except pairing is HMAC-signed (see `bridge_core::auth`) and
//! carries a fresh nonce in the body. The client learns server clock skew
//! from the `Date` header of successful responses and verifies response
//! signatures when the server sends them.
//!
//! Key rotation is atomic: the new key is committed to the credential store
//! (and the queue's payload key re-wrapped) only after a signed probe with
//! the candidate key succeeds; any failure leaves the old key active.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use bridge_core::auth::{
    self, ClockSkew, HEADER_DEVICE_ID, HEADER_KEY_VERSION, HEADER_ROTATE_KEY_VERSION,
    HEADER_SIGNATURE, HEADER_TIMESTAMP, RequestSigner,
};
use bridge_core::crypto;
use bridge_core::error::AuthError;
use bridge_core::identity::{CredentialStore, DeviceIdentity};
use bridge_core::queue;
use bridge_core::tier::Tier;

use crate::error::CloudError;

/// Connect timeout for every cloud request.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Overall timeout for ordinary requests.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Device description sent at pairing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub tier: Tier,
}

/// Config values the cloud may push back in pair/heartbeat responses.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudOverrides {
    pub heartbeat_interval: Option<u64>,
    pub queue_max_size: Option<u64>,
    pub unlock_duration: Option<u64>,
}

/// One pending command from the long-poll channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: CommandPayload,
}

/// `door.unlock` payload fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandPayload {
    pub duration_ms: Option<u64>,
    pub adapter_name: Option<String>,
}

/// Batch submission response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventsResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedEvent>,
}

/// One rejected event and why.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEvent {
    pub event_id: String,
    pub reason: String,
}

struct SignedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

/// HTTP client for the cloud control plane.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    identity: RwLock<Option<DeviceIdentity>>,
    skew: ClockSkew,
    store: Arc<CredentialStore>,
    payload_key_path: PathBuf,
    last_contact: RwLock<Option<DateTime<Utc>>>,
}

impl CloudClient {
    /// Build a client for `base_url`. The signer is installed later, once an
    /// identity is resolved or pairing completes.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        store: Arc<CredentialStore>,
        payload_key_path: PathBuf,
    ) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CloudError::Network {
                reason: format!("http client: {e}"),
            })?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            http,
            base_url,
            identity: RwLock::new(None),
            skew: ClockSkew::new(),
            store,
            payload_key_path,
            last_contact: RwLock::new(None),
        })
    }

    /// Install a resolved identity; subsequent requests sign with it.
    pub async fn install_identity(&self, identity: &DeviceIdentity) {
        *self.identity.write().await = Some(identity.clone());
    }

    /// Whether a device identity is installed.
    pub async fn is_paired(&self) -> bool {
        self.identity.read().await.is_some()
    }

    /// The paired device id, if any.
    pub async fn device_id(&self) -> Option<String> {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|i| i.device_id.clone())
    }

    async fn current_signer(&self) -> Result<RequestSigner, CloudError> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CloudError::Unpaired)?;
        Ok(RequestSigner::new(
            identity.device_id.clone(),
            &identity.device_key,
            identity.key_version,
        ))
    }

    /// When the cloud last answered a request successfully.
    pub async fn last_contact(&self) -> Option<DateTime<Utc>> {
        *self.last_contact.read().await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Pair this Bridge using a one-time pair code. The only request that is
    /// not HMAC-signed. Returns the issued identity and any config
    /// overrides; the caller persists the identity and installs it.
    ///
    /// # Errors
    ///
    /// - [`CloudError::Status`] if the code is rejected.
    /// - [`CloudError::Protocol`] if the response is malformed.
    /// - [`CloudError::Network`] on transport failure.
    pub async fn pair(
        &self,
        pair_code: &str,
        device_info: &DeviceInfo,
    ) -> Result<(DeviceIdentity, CloudOverrides), CloudError> {
        let body = json!({
            "pairCode": pair_code,
            "deviceInfo": device_info,
            "nonce": auth::request_nonce(),
        });

        let resp = self
            .http
            .post(self.url("/api/v1/devices/pair"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CloudError::Network {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let value: Value = resp.json().await.map_err(|e| CloudError::Protocol {
            reason: format!("pair response: {e}"),
        })?;
        if !status.is_success() {
            return Err(CloudError::Status {
                status: status.as_u16(),
                message: value["message"].as_str().unwrap_or("pairing rejected").to_owned(),
            });
        }

        let device_id = value["deviceId"]
            .as_str()
            .ok_or_else(|| CloudError::Protocol {
                reason: "pair response missing deviceId".to_owned(),
            })?
            .to_owned();
        let device_key = decode_key(value["deviceKey"].as_str().unwrap_or_default())?;
        let overrides: CloudOverrides =
            serde_json::from_value(value.get("config").cloned().unwrap_or_default())
                .unwrap_or_default();

        *self.last_contact.write().await = Some(Utc::now());
        let identity = DeviceIdentity {
            device_id,
            device_key,
            key_version: value["keyVersion"].as_u64().map_or(1, |v| v as u32),
            issued_at: Utc::now(),
            server_url: self.base_url.clone(),
        };
        Ok((identity, overrides))
    }

    /// Submit a batch of event projections.
    ///
    /// Accepts the server's per-event verdict even on a 4xx validation
    /// response, so the caller can fail only the named events.
    ///
    /// # Errors
    ///
    /// - [`CloudError::Status`] with 401/403 after a failed in-place
    ///   rotation attempt, or for statuses without a per-event verdict.
    /// - [`CloudError::Network`] / [`CloudError::Protocol`] as usual.
    pub async fn submit_events(&self, events: &[Value]) -> Result<EventsResponse, CloudError> {
        let body = json!({
            "nonce": auth::request_nonce(),
            "events": events,
        });
        let resp = self.signed_post("/api/v1/events", &body, REQUEST_TIMEOUT).await?;

        if resp.status.is_success() {
            return serde_json::from_value(resp.body).map_err(|e| CloudError::Protocol {
                reason: format!("events response: {e}"),
            });
        }

        if resp.status == StatusCode::UNAUTHORIZED || resp.status == StatusCode::FORBIDDEN {
            self.try_rotation_from(&resp).await;
            return Err(CloudError::Status {
                status: resp.status.as_u16(),
                message: "unauthenticated".to_owned(),
            });
        }

        // A validation failure still carries the per-event verdict.
        if resp.status.is_client_error() {
            if let Ok(verdict) = serde_json::from_value::<EventsResponse>(resp.body.clone()) {
                if !verdict.rejected.is_empty() {
                    return Ok(verdict);
                }
            }
        }

        Err(CloudError::Status {
            status: resp.status.as_u16(),
            message: resp.body["message"].as_str().unwrap_or("submit failed").to_owned(),
        })
    }

    /// Send a heartbeat; returns any config overrides the cloud pushed back.
    ///
    /// # Errors
    ///
    /// Standard [`CloudError`] set; heartbeat failures are logged by the
    /// caller and never fatal.
    pub async fn heartbeat(&self, mut body: Value) -> Result<CloudOverrides, CloudError> {
        body["nonce"] = Value::String(auth::request_nonce());
        let resp = self
            .signed_post("/api/v1/devices/heartbeat", &body, REQUEST_TIMEOUT)
            .await?;

        if resp.status == StatusCode::UNAUTHORIZED || resp.status == StatusCode::FORBIDDEN {
            self.try_rotation_from(&resp).await;
            return Err(CloudError::Status {
                status: resp.status.as_u16(),
                message: "unauthenticated".to_owned(),
            });
        }
        if !resp.status.is_success() {
            return Err(CloudError::Status {
                status: resp.status.as_u16(),
                message: resp.body["message"].as_str().unwrap_or("heartbeat failed").to_owned(),
            });
        }

        Ok(
            serde_json::from_value(resp.body.get("config").cloned().unwrap_or_default())
                .unwrap_or_default(),
        )
    }

    /// Long-poll for pending commands. The server holds the request up to
    /// 25 s; our transport allows 30.
    ///
    /// # Errors
    ///
    /// Standard [`CloudError`] set.
    pub async fn poll_commands(&self) -> Result<Vec<CloudCommand>, CloudError> {
        let resp = self
            .signed_get("/api/v1/devices/commands", REQUEST_TIMEOUT)
            .await?;

        if resp.status == StatusCode::UNAUTHORIZED || resp.status == StatusCode::FORBIDDEN {
            self.try_rotation_from(&resp).await;
            return Err(CloudError::Status {
                status: resp.status.as_u16(),
                message: "unauthenticated".to_owned(),
            });
        }
        if !resp.status.is_success() {
            return Err(CloudError::Status {
                status: resp.status.as_u16(),
                message: "command poll failed".to_owned(),
            });
        }

        let commands = resp
            .body
            .get("commands")
            .cloned()
            .unwrap_or_else(|| resp.body.clone());
        serde_json::from_value(commands).map_err(|e| CloudError::Protocol {
            reason: format!("commands response: {e}"),
        })
    }

    /// Explicit rotation entry point (ops tooling): ask the server for an
    /// envelope for `key_version` and rotate to it.
    ///
    /// # Errors
    ///
    /// [`AuthError::RotationFailed`] via [`CloudError::Auth`] when any step
    /// fails; the old key stays active.
    pub async fn request_rotation(&self, key_version: u32) -> Result<(), CloudError> {
        let body = json!({
            "keyVersion": key_version,
            "nonce": auth::request_nonce(),
        });
        let resp = self
            .signed_post("/api/v1/devices/rotate-key", &body, REQUEST_TIMEOUT)
            .await?;
        if !resp.status.is_success() {
            return Err(CloudError::Auth(AuthError::RotationFailed {
                key_version,
                reason: format!("rotate-key returned {}", resp.status),
            }));
        }
        let envelope = resp.body["keyEnvelope"]
            .as_str()
            .ok_or(CloudError::Auth(AuthError::RotationFailed {
                key_version,
                reason: "rotate-key response missing keyEnvelope".to_owned(),
            }))?
            .to_owned();
        self.rotate_to(key_version, &envelope).await
    }

    /// Rotate to a server-provided enveloped key. Commits only after a
    /// signed probe with the candidate key succeeds.
    ///
    /// # Errors
    ///
    /// [`AuthError::RotationFailed`] via [`CloudError::Auth`]; the previous
    /// key remains installed on any failure.
    pub async fn rotate_to(&self, key_version: u32, envelope_b64: &str) -> Result<(), CloudError> {
        let (device_id, new_key, old_key) = {
            let guard = self.identity.read().await;
            let identity = guard.as_ref().ok_or(CloudError::Unpaired)?;
            let signer = RequestSigner::new(
                identity.device_id.clone(),
                &identity.device_key,
                identity.key_version,
            );
            let new_key = signer.open_key_envelope(envelope_b64)?;
            (
                identity.device_id.clone(),
                new_key,
                identity.device_key.clone(),
            )
        };

        let candidate = RequestSigner::new(device_id.clone(), &new_key, key_version);
        self.probe_with(&candidate).await.map_err(|e| {
            CloudError::Auth(AuthError::RotationFailed {
                key_version,
                reason: format!("probe with new key failed: {e}"),
            })
        })?;

        // Probe passed: persist, re-wrap the queue payload key, then swap.
        let identity = DeviceIdentity {
            device_id,
            device_key: new_key.to_vec(),
            key_version,
            issued_at: Utc::now(),
            server_url: self.base_url.clone(),
        };
        self.store.set(&identity).await?;

        let old_kek = crypto::derive_key(&old_key, "payload-kek").map_err(|e| {
            CloudError::Auth(AuthError::RotationFailed {
                key_version,
                reason: format!("old kek derivation: {e}"),
            })
        })?;
        let new_kek = crypto::derive_key(&identity.device_key, "payload-kek").map_err(|e| {
            CloudError::Auth(AuthError::RotationFailed {
                key_version,
                reason: format!("new kek derivation: {e}"),
            })
        })?;
        if self.payload_key_path.exists() {
            if let Err(e) = queue::rewrap_payload_key(&self.payload_key_path, &old_kek, &new_kek) {
                tracing::error!(error = %e, "payload key re-wrap failed after rotation");
            }
        }

        self.install_identity(&identity).await;
        tracing::info!(key_version, "device key rotated");
        Ok(())
    }

    /// If an unauthenticated response carries a rotation directive, run it.
    async fn try_rotation_from(&self, resp: &SignedResponse) {
        let Some(version) = resp
            .headers
            .get(HEADER_ROTATE_KEY_VERSION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
        else {
            return;
        };

        let result = if let Some(envelope) = resp.body["keyEnvelope"].as_str() {
            self.rotate_to(version, &envelope.to_owned()).await
        } else {
            self.request_rotation(version).await
        };
        if let Err(e) = result {
            tracing::error!(key_version = version, error = %e, "server-directed key rotation failed");
        }
    }

    /// Minimal signed request proving a candidate key works.
    async fn probe_with(&self, candidate: &RequestSigner) -> Result<(), CloudError> {
        let body = json!({
            "nonce": auth::request_nonce(),
            "deviceId": candidate.device_id(),
            "probe": true,
        });
        let body_bytes = serde_json::to_vec(&body).map_err(|e| CloudError::Protocol {
            reason: e.to_string(),
        })?;
        let headers = candidate.sign(&body_bytes, Utc::now(), &self.skew);

        let resp = self
            .http
            .post(self.url("/api/v1/devices/heartbeat"))
            .header(HEADER_DEVICE_ID, &headers.device_id)
            .header(HEADER_TIMESTAMP, headers.timestamp.to_string())
            .header(HEADER_SIGNATURE, &headers.signature)
            .header(HEADER_KEY_VERSION, headers.key_version.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| CloudError::Network {
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CloudError::Status {
                status: resp.status().as_u16(),
                message: "probe rejected".to_owned(),
            })
        }
    }

    async fn signed_post(
        &self,
        path: &str,
        body: &Value,
        timeout: std::time::Duration,
    ) -> Result<SignedResponse, CloudError> {
        let body_bytes = serde_json::to_vec(body).map_err(|e| CloudError::Protocol {
            reason: e.to_string(),
        })?;
        let headers = self.sign(&body_bytes).await?;

        let request = self
            .http
            .post(self.url(path))
            .header(HEADER_DEVICE_ID, &headers.device_id)
            .header(HEADER_TIMESTAMP, headers.timestamp.to_string())
            .header(HEADER_SIGNATURE, &headers.signature)
            .header(HEADER_KEY_VERSION, headers.key_version.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body_bytes);
        self.dispatch(request).await
    }

    async fn signed_get(
        &self,
        path: &str,
        timeout: std::time::Duration,
    ) -> Result<SignedResponse, CloudError> {
        let headers = self.sign(b"").await?;
        let request = self
            .http
            .get(self.url(path))
            .header(HEADER_DEVICE_ID, &headers.device_id)
            .header(HEADER_TIMESTAMP, headers.timestamp.to_string())
            .header(HEADER_SIGNATURE, &headers.signature)
            .header(HEADER_KEY_VERSION, headers.key_version.to_string())
            .timeout(timeout);
        self.dispatch(request).await
    }

    async fn sign(&self, body: &[u8]) -> Result<bridge_core::auth::SignedHeaders, CloudError> {
        let signer = self.current_signer().await?;
        Ok(signer.sign(body, Utc::now(), &self.skew))
    }

    async fn dispatch(&self, request: reqwest::RequestBuilder) -> Result<SignedResponse, CloudError> {
        let resp = request.send().await.map_err(|e| CloudError::Network {
            reason: e.to_string(),
        })?;

        if let Some(date) = resp
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
        {
            self.skew.observe_date_header(date, Utc::now());
        }

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(|e| CloudError::Network {
            reason: e.to_string(),
        })?;

        if status.is_success() {
            *self.last_contact.write().await = Some(Utc::now());
        }

        // Verify the response signature when the server signs its replies.
        if let (Some(sig), Some(ts)) = (
            headers.get(HEADER_SIGNATURE).and_then(|v| v.to_str().ok()),
            headers
                .get(HEADER_TIMESTAMP)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok()),
        ) {
            if let Ok(signer) = self.current_signer().await {
                signer.verify(text.as_bytes(), ts, sig)?;
            }
        }

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::Null)
        };
        Ok(SignedResponse {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, CloudError> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| CloudError::Protocol {
            reason: format!("deviceKey not base64: {e}"),
        })?;
    if bytes.len() != 32 {
        return Err(CloudError::Protocol {
            reason: format!("deviceKey must be 32 bytes, got {}", bytes.len()),
        });
    }
    Ok(bytes)
}
