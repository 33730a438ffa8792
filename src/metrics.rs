//! Prometheus counters and gauges for the server
//!
//! All metrics live in a dedicated registry so tests can instantiate
//! isolated sets without colliding on the global default.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    pub frames_uploaded_total: IntCounter,
    pub frame_upload_bytes_total: IntCounter,
    pub frame_upload_errors: IntCounter,
    pub ws_connections_total: IntCounter,
    pub ws_reject_total: IntCounter,
    pub webrtc_packets_in: IntCounter,
    pub webrtc_packets_out: IntCounter,
    pub rate_limiter_entries: IntGauge,
    pub rate_limiter_evictions_total: IntCounter,
    pub idempotency_entries: IntGauge,
    pub idempotency_evictions_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let m = Self {
            frames_uploaded_total: counter(
                &registry,
                "ermete_frames_uploaded_total",
                "Number of successfully uploaded frames",
            )?,
            frame_upload_bytes_total: counter(
                &registry,
                "ermete_frame_upload_bytes_total",
                "Total bytes received from frame uploads",
            )?,
            frame_upload_errors: counter(
                &registry,
                "ermete_frame_upload_errors_total",
                "Number of upload errors",
            )?,
            ws_connections_total: counter(
                &registry,
                "ermete_ws_connections_total",
                "Total WebSocket connections",
            )?,
            ws_reject_total: counter(
                &registry,
                "ermete_ws_rejections_total",
                "Rejected WebSocket connections",
            )?,
            webrtc_packets_in: counter(
                &registry,
                "ermete_webrtc_rtp_in_total",
                "Inbound RTP packets",
            )?,
            webrtc_packets_out: counter(
                &registry,
                "ermete_webrtc_rtp_out_total",
                "Outbound RTP packets",
            )?,
            rate_limiter_entries: gauge(
                &registry,
                "ermete_rate_limiter_entries",
                "Current number of IP entries in the in-app rate limiter",
            )?,
            rate_limiter_evictions_total: counter(
                &registry,
                "ermete_rate_limiter_evictions_total",
                "Evicted in-app rate limiter entries",
            )?,
            idempotency_entries: gauge(
                &registry,
                "ermete_idempotency_entries",
                "Current idempotency key entries in memory",
            )?,
            idempotency_evictions_total: counter(
                &registry,
                "ermete_idempotency_evictions_total",
                "Evicted idempotency keys from in-memory store",
            )?,
            registry,
        };
        Ok(m)
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "metrics encode failed");
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_renders() {
        let metrics = Metrics::new().unwrap();
        metrics.frames_uploaded_total.inc();
        metrics.idempotency_entries.set(3);

        let text = metrics.render();
        assert!(text.contains("ermete_frames_uploaded_total 1"));
        assert!(text.contains("ermete_idempotency_entries 3"));
    }

    #[test]
    fn independent_registries_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.ws_connections_total.inc();
        assert_eq!(b.ws_connections_total.get(), 0);
    }
}
