//! Liveness and full-status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use super::ApiState;
use crate::error::ApiError;

/// `GET /health` — liveness.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "uptimeMs": state.started_at.elapsed().as_millis() as u64,
    }))
}

/// `GET /api/v1/status` — everything an operator wants on one screen.
pub async fn full_status(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Value>, ApiError> {
    let queue_stats = state
        .queue
        .stats()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let params = *state.tier_rx.borrow();
    let adapters = state.adapters.health().await;
    let device_id = state.cloud.device_id().await;
    let last_contact = state.cloud.last_contact().await;

    Ok(Json(json!({
        "version": crate::VERSION,
        "uptimeMs": state.started_at.elapsed().as_millis() as u64,
        "paired": device_id.is_some(),
        "deviceId": device_id,
        "tier": params.tier,
        "queue": {
            "stats": queue_stats,
            "counters": state.queue.counters(),
            "maxSize": params.queue_max_size,
        },
        "pipeline": state.processor.counters(),
        "submission": state.submit_counters.snapshot(),
        "sinkDropped": state.sink.dropped(),
        "adapters": adapters,
        "lastCloudContact": last_contact.map(|t| t.to_rfc3339()),
    })))
}
