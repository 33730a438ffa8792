//! Signaling upgrade endpoint
//!
//! `GET /v1/ws` runs, in order and each short-circuiting: PSK check, rate
//! limit for the client IP, origin check, WebSocket upgrade. A rejected
//! origin never upgrades (403). Session contention is only discovered
//! after the upgrade: the loser receives a single in-band error frame and
//! the socket closes immediately.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use super::{check_psk, rate_limited, unauthorized, AppState, AuthQuery};
use crate::config::Config;

pub async fn handle_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip().to_string();
    let cfg = &state.config;

    if let Err(reason) = check_psk(cfg, &headers, query.psk.as_deref()) {
        return unauthorized(&ip, "/v1/ws", reason);
    }
    if !state
        .limits
        .allow(&ip, cfg.ws_rate_per_sec, cfg.ws_rate_burst)
    {
        return rate_limited();
    }

    let origin = normalize_origin(
        headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
    );
    if !origin_allowed(cfg, &origin) {
        state.metrics.ws_reject_total.inc();
        warn!(ip = %ip, path = "/v1/ws", origin = %origin, "websocket origin rejected");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "forbidden origin"})),
        )
            .into_response();
    }

    let rtc = state.rtc.clone();
    ws.on_upgrade(move |socket| rtc.handle_socket(socket))
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_string()
}

fn origin_allowed(cfg: &Config, origin: &str) -> bool {
    if origin.is_empty() {
        return cfg.ws_allow_no_origin;
    }
    if cfg.ws_allow_any_origin {
        return true;
    }
    cfg.ws_allowed_origins
        .iter()
        .any(|allowed| normalize_origin(allowed) == origin)
}
