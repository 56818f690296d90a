//! Runtime adapter control.
//!
//! Enable/disable act on the in-memory adapter table only; the change is
//! persisted to the config file only by an explicit `POST /api/v1/config`.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};

use super::ApiState;
use crate::error::ApiError;

/// `GET /api/v1/adapters` — health of every managed adapter.
pub async fn list(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let adapters = state.adapters.health().await;
    Json(json!({ "adapters": adapters }))
}

/// `POST /api/v1/adapters/{name}/enable`.
pub async fn enable(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_auth(&headers, &body)?;
    state
        .adapters
        .enable(&name)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    // Reflect the change in the in-memory config snapshot so a subsequent
    // persist captures it.
    state.config_tx.send_modify(|config| {
        let mut next = (**config).clone();
        if !next.enabled_adapters.contains(&name) {
            next.enabled_adapters.push(name.clone());
        }
        *config = Arc::new(next);
    });

    Ok(Json(json!({ "adapter": name, "enabled": true })))
}

/// `POST /api/v1/adapters/{name}/disable`.
pub async fn disable(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_auth(&headers, &body)?;
    state
        .adapters
        .disable(&name)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    state.config_tx.send_modify(|config| {
        let mut next = (**config).clone();
        next.enabled_adapters.retain(|n| n != &name);
        *config = Arc::new(next);
    });

    Ok(Json(json!({ "adapter": name, "enabled": false })))
}
