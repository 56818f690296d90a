//! Agent-level error types: the cloud client and the local HTTP API.
//!
//! Cloud errors separate "the network ate it" (always retried) from "the
//! server said no" (handled per status). Local API errors map onto JSON
//! responses with a machine-readable `error` field and a human-readable
//! `message`, mirroring what the cloud side returns to us.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use bridge_core::error::{AuthError, CommandError, ConfigError, IdentityError, QueueError};

/// Errors from talking to the cloud control plane.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// Transport-level failure: DNS, connect, timeout, TLS. Always retriable.
    #[error("network error: {reason}")]
    Network { reason: String },

    /// The server answered with a non-success status.
    #[error("cloud returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body did not match the protocol.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// We have no identity yet — the Bridge is unpaired.
    #[error("bridge is not paired")]
    Unpaired,

    /// Signing, verification, or rotation failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The credential store rejected a rotation persist.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl CloudError {
    /// Whether the submission loop should retry with backoff.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Status { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            Self::Protocol { .. } | Self::Unpaired | Self::Auth(_) | Self::Identity(_) => false,
        }
    }

    /// Whether the server rejected our credentials.
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

/// Application-level error returned from local API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid local HMAC auth.
    Unauthorized(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// Requested resource not found.
    NotFound(String),
    /// Door-unlock rate limit hit.
    RateLimited { retry_after_secs: u64 },
    /// The requested operation conflicts with current state.
    Conflict(String),
    /// Internal failure.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("unlock rate limit reached, retry in {retry_after_secs}s"),
            ),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full => Self::Conflict(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { .. } => Self::Internal(err.to_string()),
            _ => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::NoDoorAdapter | CommandError::UnknownCommand { .. } => {
                Self::BadRequest(err.to_string())
            }
            CommandError::Replay { .. } => Self::Conflict(err.to_string()),
            CommandError::Unlock { .. } => Self::Internal(err.to_string()),
        }
    }
}
