//! The local control API.
//!
//! An HTTP listener on localhost (configurable) for operators and install
//! tooling: liveness, full status, recent events, adapter control, door
//! unlock, and a config subset. Mutating endpoints verify a local HMAC when
//! `api_server.auth.enabled` — the key is provisioned locally and is not
//! the cloud device key. CORS origins are an explicit allowlist.

mod adapters;
mod config;
mod door;
mod events;
mod status;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::routing::{get, post};
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use bridge_core::auth::{HEADER_SIGNATURE, HEADER_TIMESTAMP, RequestSigner};
use bridge_core::config::BridgeConfig;
use bridge_core::deadletter::DeadLetterLog;
use bridge_core::processor::EventProcessor;
use bridge_core::queue::DurableQueue;
use bridge_core::tier::TierParams;

use crate::cloud::CloudClient;
use crate::door::DoorController;
use crate::error::ApiError;
use crate::fleet::AdapterSet;
use crate::sink::ProcessorSink;
use crate::submit::SubmitCounters;

/// Unlock calls allowed per rate-limit window.
const UNLOCK_LIMIT: usize = 10;

/// Unlock rate-limit window.
const UNLOCK_WINDOW: Duration = Duration::from_secs(60);

/// Everything the handlers need.
pub struct ApiState {
    pub started_at: Instant,
    pub queue: Arc<DurableQueue>,
    pub processor: Arc<EventProcessor>,
    pub adapters: Arc<AdapterSet>,
    pub cloud: Arc<CloudClient>,
    pub door: Arc<DoorController>,
    pub dead_letter: Arc<DeadLetterLog>,
    pub submit_counters: Arc<SubmitCounters>,
    pub sink: Arc<ProcessorSink>,
    pub config_tx: watch::Sender<Arc<BridgeConfig>>,
    pub config_path: Option<PathBuf>,
    pub tier_rx: watch::Receiver<TierParams>,
    pub unlock_limiter: Mutex<VecDeque<Instant>>,
    local_signer: Option<RequestSigner>,
}

impl ApiState {
    /// Current config snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config_tx.borrow().clone()
    }

    /// Verify local HMAC auth over a request body. A no-op when auth is
    /// disabled.
    ///
    /// Clients sign `body || "\n" || unix_seconds || "\n" || "local"` with
    /// the configured key and send `X-Timestamp` / `X-Signature`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Unauthorized`] on missing or invalid credentials.
    pub fn require_auth(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
        let Some(signer) = &self.local_signer else {
            return Ok(());
        };

        let timestamp = headers
            .get(HEADER_TIMESTAMP)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing X-Timestamp".to_owned()))?;
        let signature = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing X-Signature".to_owned()))?;

        RequestSigner::check_timestamp(timestamp, Utc::now())
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        signer
            .verify(body, timestamp, signature)
            .map_err(|_| ApiError::Unauthorized("signature mismatch".to_owned()))
    }

    /// Enforce the unlock rate limit (10 per rolling 60 s).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::RateLimited`] when the window is exhausted.
    pub async fn check_unlock_rate(&self) -> Result<(), ApiError> {
        let mut window = self.unlock_limiter.lock().await;
        admit_unlock(&mut window, Instant::now())
            .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })
    }
}

/// Sliding-window admission: at most [`UNLOCK_LIMIT`] entries per
/// [`UNLOCK_WINDOW`]. On rejection returns the seconds until a slot frees.
fn admit_unlock(window: &mut VecDeque<Instant>, now: Instant) -> Result<(), u64> {
    while window
        .front()
        .is_some_and(|t| now.duration_since(*t) > UNLOCK_WINDOW)
    {
        window.pop_front();
    }
    if window.len() >= UNLOCK_LIMIT {
        let retry_after_secs = window.front().map_or(1, |oldest| {
            UNLOCK_WINDOW
                .saturating_sub(now.duration_since(*oldest))
                .as_secs()
                .max(1)
        });
        return Err(retry_after_secs);
    }
    window.push_back(now);
    Ok(())
}

/// Build the API state from the supervisor's wiring.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn build_state(
    started_at: Instant,
    queue: Arc<DurableQueue>,
    processor: Arc<EventProcessor>,
    adapters: Arc<AdapterSet>,
    cloud: Arc<CloudClient>,
    door: Arc<DoorController>,
    dead_letter: Arc<DeadLetterLog>,
    submit_counters: Arc<SubmitCounters>,
    sink: Arc<ProcessorSink>,
    config_tx: watch::Sender<Arc<BridgeConfig>>,
    config_path: Option<PathBuf>,
    tier_rx: watch::Receiver<TierParams>,
) -> Arc<ApiState> {
    let config = config_tx.borrow().clone();
    let local_signer = if config.api_server.auth.enabled {
        config
            .api_server
            .auth
            .key
            .as_deref()
            .and_then(|k| hex::decode(k).ok())
            .map(|key| RequestSigner::new("local", &key, 1))
    } else {
        None
    };

    Arc::new(ApiState {
        started_at,
        queue,
        processor,
        adapters,
        cloud,
        door,
        dead_letter,
        submit_counters,
        sink,
        config_tx,
        config_path,
        tier_rx,
        unlock_limiter: Mutex::new(VecDeque::new()),
        local_signer,
    })
}

/// Build the router with all routes and middleware.
#[must_use]
pub fn build_router(state: Arc<ApiState>) -> Router {
    let config = state.config();

    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static(HEADER_TIMESTAMP),
            axum::http::HeaderName::from_static(HEADER_SIGNATURE),
        ]);
    let origins: Vec<HeaderValue> = config
        .api_server
        .cors_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    cors = cors.allow_origin(AllowOrigin::list(origins));

    Router::new()
        .route("/health", get(status::health))
        .route("/api/v1/status", get(status::full_status))
        .route("/api/v1/events", get(events::recent))
        .route("/api/v1/deadletter", get(events::deadletter_tail))
        .route("/api/v1/adapters", get(adapters::list))
        .route(
            "/api/v1/adapters/{name}/enable",
            post(adapters::enable)
                .layer(tower::limit::ConcurrencyLimitLayer::new(2)),
        )
        .route(
            "/api/v1/adapters/{name}/disable",
            post(adapters::disable)
                .layer(tower::limit::ConcurrencyLimitLayer::new(2)),
        )
        .route(
            "/api/v1/door/unlock",
            post(door::unlock).layer(tower::limit::ConcurrencyLimitLayer::new(2)),
        )
        .route(
            "/api/v1/config",
            get(config::read)
                .put(config::update)
                .post(config::persist),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eleventh_unlock_within_the_window_is_rejected() {
        let mut window = VecDeque::new();
        let start = Instant::now();
        for i in 0..10 {
            admit_unlock(&mut window, start + Duration::from_secs(i)).unwrap_or_else(|_| {
                unreachable!("first ten calls must pass");
            });
        }
        let rejected = admit_unlock(&mut window, start + Duration::from_secs(30));
        assert!(rejected.is_err());
    }

    #[test]
    fn slots_free_up_after_the_window_passes() {
        let mut window = VecDeque::new();
        let start = Instant::now();
        for _ in 0..10 {
            let _ = admit_unlock(&mut window, start);
        }
        assert!(admit_unlock(&mut window, start + Duration::from_secs(30)).is_err());
        // 61 s later the original burst has aged out.
        assert!(admit_unlock(&mut window, start + Duration::from_secs(61)).is_ok());
    }
}
