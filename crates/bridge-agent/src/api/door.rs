//! Door-unlock endpoint.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiState;
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UnlockRequest {
    adapter_name: Option<String>,
    duration_ms: Option<u64>,
}

/// `POST /api/v1/door/unlock` — body `{adapterName?, durationMs?}`.
///
/// Rate-limited to 10 per rolling minute; requires local HMAC auth when
/// enabled. The body is read raw so the signature covers the exact bytes.
pub async fn unlock(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_auth(&headers, &body)?;
    state.check_unlock_rate().await?;

    let request: UnlockRequest = if body.is_empty() {
        UnlockRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?
    };

    let outcome = state
        .door
        .unlock(request.adapter_name.as_deref(), request.duration_ms)
        .await?;
    Ok(Json(json!({
        "unlocked": true,
        "adapter": outcome.adapter,
        "durationMs": outcome.duration_ms,
    })))
}
