//! Shared test fixtures.

use std::time::Duration;

use crate::config::{Config, SessionPolicy};

/// A fully-populated config with permissive rates, suitable as a baseline
/// for unit tests that tweak individual fields.
pub fn test_config(data_dir: &str) -> Config {
    Config {
        http_addr: ":0".into(),
        data_dir: data_dir.into(),
        max_upload_mb: 10,
        cors_allowed_origins: vec![],
        session_policy: SessionPolicy::RejectSecond,
        log_level: "info".into(),
        tls_cert_file: String::new(),
        tls_key_file: String::new(),
        psk: "secret".into(),
        psk_header: "X-Ermete-PSK".into(),
        psk_allow_query: false,
        ws_allowed_origins: vec![],
        ws_allow_no_origin: true,
        ws_allow_any_origin: false,
        read_header_timeout: Duration::from_secs(10),
        read_timeout: Duration::from_secs(30),
        write_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(120),
        shutdown_grace: Duration::from_secs(15),
        upload_rate_per_sec: 100.0,
        upload_rate_burst: 100,
        ws_rate_per_sec: 100.0,
        ws_rate_burst: 100,
        rate_limit_max_entries: 1000,
        rate_limit_ttl: Duration::from_secs(1800),
        idempotency_ttl: Duration::from_secs(600),
        idempotency_max: 1000,
        webrtc_stun_urls: vec![],
        webrtc_turn_urls: vec![],
        webrtc_turn_user: String::new(),
        webrtc_turn_pass: String::new(),
    }
}
