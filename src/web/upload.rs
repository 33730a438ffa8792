//! Frame ingest endpoint
//!
//! `POST /v1/frames` accepts either a raw body or a `multipart/form-data`
//! envelope with a `file` field. Both paths go through a bounded reader
//! whose "too large" failure is distinguishable from other parse errors,
//! so oversized payloads map to 413 and everything else malformed to 400.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequest, Multipart, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::{check_psk, rate_limited, unauthorized, AppState, AuthQuery};

#[derive(Debug, Error)]
enum UploadError {
    #[error("payload too large")]
    TooLarge,
    #[error("{0}")]
    Bad(String),
}

pub async fn handle_frame_upload(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AuthQuery>,
    request: Request,
) -> Response {
    let ip = addr.ip().to_string();
    let cfg = &state.config;

    if let Err(reason) = check_psk(cfg, request.headers(), query.psk.as_deref()) {
        return unauthorized(&ip, "/v1/frames", reason);
    }
    if !state
        .limits
        .allow(&ip, cfg.upload_rate_per_sec, cfg.upload_rate_burst)
    {
        return rate_limited();
    }

    let headers = request.headers();
    let frame_id = header_value(headers, "X-Frame-Id");
    let timestamp = header_value(headers, "X-Timestamp");
    let idem_key = header_value(headers, "X-Idempotency-Key");
    let content_type = header_value(headers, header::CONTENT_TYPE.as_str());

    let max_bytes = cfg.max_upload_bytes();
    let read = if content_type.starts_with("multipart/form-data") {
        read_multipart_payload(request, max_bytes).await
    } else {
        read_body_limited(request, max_bytes)
            .await
            .map(|payload| (payload, content_type.clone()))
    };
    let (payload, content_type) = match read {
        Ok(ok) => ok,
        Err(UploadError::TooLarge) => {
            state.metrics.frame_upload_errors.inc();
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "payload too large"})),
            )
                .into_response();
        }
        Err(UploadError::Bad(e)) => {
            state.metrics.frame_upload_errors.inc();
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": format!("invalid payload: {}", e)})),
            )
                .into_response();
        }
    };

    let meta = match state
        .store
        .save_frame(&frame_id, &timestamp, &idem_key, &content_type, &payload)
    {
        Ok(meta) => meta,
        Err(e) => {
            state.metrics.frame_upload_errors.inc();
            warn!(ip = %ip, error = %e, "frame save failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to save frame"})),
            )
                .into_response();
        }
    };

    state.metrics.frames_uploaded_total.inc();
    state
        .metrics
        .frame_upload_bytes_total
        .inc_by(payload.len() as u64);
    state.sessions.touch();

    Json(serde_json::json!({
        "status": "ok",
        "duplicate": meta.duplicate,
        "frame": meta,
        "request_id": Uuid::new_v4().to_string(),
    }))
    .into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Read the raw request body, failing with the too-large sentinel as soon
/// as the accumulated payload exceeds `max_bytes`.
async fn read_body_limited(request: Request, max_bytes: usize) -> Result<Vec<u8>, UploadError> {
    let mut stream = request.into_body().into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UploadError::Bad(e.to_string()))?;
        if buf.len() + chunk.len() > max_bytes {
            return Err(UploadError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Pull the `file` field out of a multipart form, bounded the same way as
/// the raw path. The part's own content type wins; absent one, the payload
/// is treated as an opaque octet stream.
async fn read_multipart_payload(
    request: Request,
    max_bytes: usize,
) -> Result<(Vec<u8>, String), UploadError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| UploadError::Bad(e.to_string()))?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| UploadError::Bad(e.to_string()))?;
        let Some(mut field) = field else {
            return Err(UploadError::Bad("missing file field".into()));
        };
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mut buf = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| UploadError::Bad(e.to_string()))?
        {
            if buf.len() + chunk.len() > max_bytes {
                return Err(UploadError::TooLarge);
            }
            buf.extend_from_slice(&chunk);
        }
        return Ok((buf, content_type));
    }
}
