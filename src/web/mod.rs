//! HTTP surface: axum router, auth, health, and metrics
//!
//! Routes:
//! - `GET /healthz` — liveness
//! - `GET /readyz` — frames directory exists
//! - `GET /metrics` — Prometheus text exposition
//! - `POST /v1/frames` — frame ingest (PSK + rate limit)
//! - `GET /v1/ws` — signaling upgrade (PSK + rate limit + origin check)

pub mod rate_limit;
pub mod upload;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::rtc::RtcService;
use crate::session::SessionManager;
use crate::storage::FrameStore;
use rate_limit::RateLimiter;

pub struct AppState {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub store: Arc<FrameStore>,
    pub sessions: Arc<SessionManager>,
    pub rtc: Arc<RtcService>,
    pub limits: Arc<RateLimiter>,
}

/// Optional `?psk=` query fallback for clients that cannot set headers.
#[derive(Debug, Deserialize, Default)]
pub struct AuthQuery {
    pub psk: Option<String>,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let cfg = &state.config;

    // The framework-level cap sits above our bounded reader so oversized
    // uploads surface as 413 from our sentinel, not a generic read error.
    let frames = Router::new()
        .route("/v1/frames", post(upload::handle_frame_upload))
        .layer(DefaultBodyLimit::max(cfg.max_upload_bytes() + 1024 * 1024))
        .layer(TimeoutLayer::new(cfg.read_timeout));

    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .route("/v1/ws", get(ws::handle_ws_upgrade))
        .merge(frames)
        .layer(middleware::from_fn(request_logger));

    if !cfg.cors_allowed_origins.is_empty() {
        app = app.layer(cors_layer(&cfg.cors_allowed_origins));
    }

    app.with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    if state.store.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage not ready").into_response()
    }
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Validate the pre-shared key from the configured header, falling back to
/// the `psk` query parameter when enabled. Returns the rejection reason on
/// failure. An empty configured PSK disables the check (only reachable via
/// `ERMETE_ALLOW_NO_PSK`).
pub fn check_psk(
    cfg: &Config,
    headers: &HeaderMap,
    query_psk: Option<&str>,
) -> Result<(), &'static str> {
    if cfg.psk.is_empty() {
        return Ok(());
    }
    let mut provided = headers
        .get(cfg.psk_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided.is_empty() && cfg.psk_allow_query {
        provided = query_psk.unwrap_or_default();
    }
    if provided.is_empty() {
        return Err("missing psk");
    }
    if !constant_time_eq(provided.as_bytes(), cfg.psk.as_bytes()) {
        return Err("invalid psk");
    }
    Ok(())
}

/// Constant-time byte comparison. Length is allowed to leak; contents are
/// compared without early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) fn unauthorized(ip: &str, path: &str, reason: &str) -> Response {
    warn!(ip = %ip, path = %path, reason = %reason, "auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "unauthorized"})),
    )
        .into_response()
}

pub(crate) fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({"error": "rate limited"})),
    )
        .into_response()
}
