//! HMAC request authentication for the cloud API.
//!
//! Every outbound request (except pairing) is signed with the device key:
//!
//! ```text
//! signature = HMAC-SHA256(device_key, body || "\n" || unix_seconds || "\n" || device_id)
//! ```
//!
//! carried as `X-Device-Id`, `X-Timestamp`, `X-Signature` (hex), and
//! `X-Key-Version` headers. The server rejects requests more than 300 s off
//! its own clock, so the signer tracks a rolling offset learned from the
//! `Date` header of successful responses and bakes it into the signed
//! timestamp.
//!
//! Key rotation is atomic at the call site: a new key becomes current only
//! after a signed probe with it succeeds; this module only opens the server's
//! key envelope and builds signers.

use std::sync::atomic::{AtomicI64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, EncryptionKey};
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated distance between our signed timestamp and the server
/// clock, in seconds.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Offsets beyond this are logged loudly before being applied.
const SKEW_WARN_SECS: i64 = 60;

/// Header names shared between the cloud client and the local API auth.
pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_KEY_VERSION: &str = "x-key-version";
/// Server-initiated rotation trigger.
pub const HEADER_ROTATE_KEY_VERSION: &str = "x-rotate-key-version";

/// The headers attached to a signed request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub device_id: String,
    /// Unix seconds, already adjusted for learned server skew.
    pub timestamp: i64,
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
    pub key_version: u32,
}

/// Signs outbound requests and verifies signed responses for one device key.
///
/// Cheap to construct; the cloud client builds a fresh signer when the key
/// rotates. The rolling skew offset is shared through an `AtomicI64` owned by
/// the caller so it survives signer replacement.
pub struct RequestSigner {
    device_id: String,
    key: SigningKey,
    key_version: u32,
}

/// Device key bytes, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SigningKey(Vec<u8>);

impl RequestSigner {
    /// Create a signer for the given device credential.
    #[must_use]
    pub fn new(device_id: impl Into<String>, device_key: &[u8], key_version: u32) -> Self {
        Self {
            device_id: device_id.into(),
            key: SigningKey(device_key.to_vec()),
            key_version,
        }
    }

    /// The device id this signer authenticates as.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The key version carried in `X-Key-Version`.
    #[must_use]
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Sign a request body at the given wall-clock time, applying the
    /// learned server skew from `skew`.
    #[must_use]
    pub fn sign(&self, body: &[u8], now: DateTime<Utc>, skew: &ClockSkew) -> SignedHeaders {
        let timestamp = now.timestamp() + skew.offset_secs();
        let signature = self.compute(body, timestamp);
        SignedHeaders {
            device_id: self.device_id.clone(),
            timestamp,
            signature,
            key_version: self.key_version,
        }
    }

    /// Verify a signature over `body` and `timestamp` against this key.
    ///
    /// Used for signed responses and for the local control API. Comparison is
    /// constant-time via the MAC's own verifier.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidSignature`] if the signature is not valid
    /// hex or does not match.
    pub fn verify(&self, body: &[u8], timestamp: i64, signature_hex: &str) -> Result<(), AuthError> {
        let expected = hex::decode(signature_hex).map_err(|_| AuthError::InvalidSignature)?;
        let mut mac = self.mac();
        mac.update(&Self::message(body, timestamp, &self.device_id));
        mac.verify_slice(&expected)
            .map_err(|_| AuthError::InvalidSignature)
    }

    /// Check that a request timestamp is inside the accepted skew window
    /// relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ClockSkew`] when outside the window.
    pub fn check_timestamp(timestamp: i64, now: DateTime<Utc>) -> Result<(), AuthError> {
        let offset = (now.timestamp() - timestamp).abs();
        if offset > MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::ClockSkew {
                offset_secs: offset,
                limit_secs: MAX_CLOCK_SKEW_SECS,
            });
        }
        Ok(())
    }

    /// Open a base64 AES-256-GCM key envelope sealed under the current
    /// device key, yielding the next device key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Envelope`] if the envelope is malformed or does
    /// not decrypt to exactly 32 bytes.
    pub fn open_key_envelope(&self, envelope_b64: &str) -> Result<[u8; 32], AuthError> {
        let sealed = BASE64
            .decode(envelope_b64.trim())
            .map_err(|e| AuthError::Envelope {
                reason: format!("invalid base64: {e}"),
            })?;

        let kek = crypto::derive_key(&self.key.0, "key-rotation-envelope").map_err(|e| {
            AuthError::Envelope {
                reason: e.to_string(),
            }
        })?;
        let plaintext = crypto::decrypt(&kek, &sealed).map_err(|e| AuthError::Envelope {
            reason: e.to_string(),
        })?;

        <[u8; 32]>::try_from(plaintext.as_slice()).map_err(|_| AuthError::Envelope {
            reason: format!("expected 32-byte key, got {} bytes", plaintext.len()),
        })
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC-SHA256 accepts keys of any length; new_from_slice cannot fail.
        #[allow(clippy::expect_used)]
        HmacSha256::new_from_slice(&self.key.0).expect("hmac accepts any key length")
    }

    fn message(body: &[u8], timestamp: i64, device_id: &str) -> Vec<u8> {
        let ts = timestamp.to_string();
        let mut msg = Vec::with_capacity(body.len() + 1 + ts.len() + 1 + device_id.len());
        msg.extend_from_slice(body);
        msg.push(b'\n');
        msg.extend_from_slice(ts.as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(device_id.as_bytes());
        msg
    }

    fn compute(&self, body: &[u8], timestamp: i64) -> String {
        let mut mac = self.mac();
        mac.update(&Self::message(body, timestamp, &self.device_id));
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("device_id", &self.device_id)
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}

/// Rolling clock-skew offset learned from server `Date` headers.
///
/// Shared across signer replacements so a key rotation does not forget the
/// learned offset.
#[derive(Debug, Default)]
pub struct ClockSkew {
    offset_secs: AtomicI64,
}

impl ClockSkew {
    /// Start with no learned offset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current offset (server minus local), in seconds.
    #[must_use]
    pub fn offset_secs(&self) -> i64 {
        self.offset_secs.load(Ordering::Relaxed)
    }

    /// Learn the offset from a server `Date` header observed at local time
    /// `local_now`. Malformed headers are ignored.
    pub fn observe_date_header(&self, date_header: &str, local_now: DateTime<Utc>) {
        let Ok(server_time) = DateTime::parse_from_rfc2822(date_header) else {
            tracing::debug!(header = %date_header, "unparseable Date header, skew unchanged");
            return;
        };
        let offset = server_time.with_timezone(&Utc).timestamp() - local_now.timestamp();
        if offset.abs() > SKEW_WARN_SECS {
            tracing::warn!(
                offset_secs = offset,
                "local clock is far from the server clock, compensating in signatures"
            );
        }
        self.offset_secs.store(offset, Ordering::Relaxed);
    }
}

/// A fresh 128-bit request nonce, hex-encoded.
///
/// Included in every signed request body; the server rejects duplicates.
#[must_use]
pub fn request_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn signer() -> RequestSigner {
        RequestSigner::new("dev_x", &[7u8; 32], 1)
    }

    #[test]
    fn signature_round_trips() {
        let s = signer();
        let skew = ClockSkew::new();
        let now = Utc::now();
        let headers = s.sign(b"{\"hello\":true}", now, &skew);
        s.verify(b"{\"hello\":true}", headers.timestamp, &headers.signature)
            .unwrap();
    }

    #[test]
    fn altering_body_invalidates_signature() {
        let s = signer();
        let headers = s.sign(b"{\"hello\":true}", Utc::now(), &ClockSkew::new());
        let err = s.verify(b"{\"hello\":false}", headers.timestamp, &headers.signature);
        assert!(matches!(err, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn altering_timestamp_invalidates_signature() {
        let s = signer();
        let headers = s.sign(b"body", Utc::now(), &ClockSkew::new());
        let err = s.verify(b"body", headers.timestamp + 1, &headers.signature);
        assert!(matches!(err, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn different_device_id_invalidates_signature() {
        let a = RequestSigner::new("dev_a", &[7u8; 32], 1);
        let b = RequestSigner::new("dev_b", &[7u8; 32], 1);
        let headers = a.sign(b"body", Utc::now(), &ClockSkew::new());
        assert!(b.verify(b"body", headers.timestamp, &headers.signature).is_err());
    }

    #[test]
    fn skew_window_is_enforced() {
        let now = Utc::now();
        RequestSigner::check_timestamp(now.timestamp() - 299, now).unwrap();
        RequestSigner::check_timestamp(now.timestamp() + 299, now).unwrap();
        assert!(matches!(
            RequestSigner::check_timestamp(now.timestamp() - 301, now),
            Err(AuthError::ClockSkew { .. })
        ));
    }

    #[test]
    fn learned_offset_shifts_signed_timestamp() {
        let s = signer();
        let skew = ClockSkew::new();
        let now = Utc::now();
        // Server reports 120 s ahead of us.
        let server = (now + chrono::Duration::seconds(120)).to_rfc2822();
        skew.observe_date_header(&server, now);
        assert_eq!(skew.offset_secs(), 120);

        let headers = s.sign(b"body", now, &skew);
        assert_eq!(headers.timestamp, now.timestamp() + 120);
    }

    #[test]
    fn malformed_date_header_is_ignored() {
        let skew = ClockSkew::new();
        skew.observe_date_header("not a date", Utc::now());
        assert_eq!(skew.offset_secs(), 0);
    }

    #[test]
    fn key_envelope_round_trips() {
        let s = signer();
        let kek = crypto::derive_key(&[7u8; 32], "key-rotation-envelope").unwrap();
        let next_key = [9u8; 32];
        let envelope = BASE64.encode(crypto::encrypt(&kek, &next_key).unwrap());
        assert_eq!(s.open_key_envelope(&envelope).unwrap(), next_key);
    }

    #[test]
    fn envelope_under_wrong_key_is_rejected() {
        let s = signer();
        let kek = crypto::derive_key(&[8u8; 32], "key-rotation-envelope").unwrap();
        let envelope = BASE64.encode(crypto::encrypt(&kek, &[9u8; 32]).unwrap());
        assert!(matches!(
            s.open_key_envelope(&envelope),
            Err(AuthError::Envelope { .. })
        ));
    }

    #[test]
    fn nonces_are_unique_and_hex() {
        let a = request_nonce();
        let b = request_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }
}
