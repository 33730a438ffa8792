//! Environment-driven server configuration
//!
//! Every option is read from the environment at startup; invalid values
//! fail process start with a readable reason rather than starting in a
//! half-configured state.

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// What happens when a second peer tries to connect while one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    /// The newcomer is rejected with an in-band error.
    RejectSecond,
    /// The incumbent is closed and the newcomer takes its place.
    KickPrevious,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub data_dir: String,
    pub max_upload_mb: i64,
    pub cors_allowed_origins: Vec<String>,
    pub session_policy: SessionPolicy,
    pub log_level: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,

    pub psk: String,
    pub psk_header: String,
    pub psk_allow_query: bool,

    pub ws_allowed_origins: Vec<String>,
    pub ws_allow_no_origin: bool,
    pub ws_allow_any_origin: bool,

    pub read_header_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,

    pub upload_rate_per_sec: f64,
    pub upload_rate_burst: u32,
    pub ws_rate_per_sec: f64,
    pub ws_rate_burst: u32,
    pub rate_limit_max_entries: usize,
    pub rate_limit_ttl: Duration,

    pub idempotency_ttl: Duration,
    pub idempotency_max: usize,

    pub webrtc_stun_urls: Vec<String>,
    pub webrtc_turn_urls: Vec<String>,
    pub webrtc_turn_user: String,
    pub webrtc_turn_pass: String,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let max_upload_mb = parse_int_env("MAX_UPLOAD_MB", 10)?;
        if max_upload_mb <= 0 {
            bail!("MAX_UPLOAD_MB must be > 0");
        }

        let session_policy = match get_env("SESSION_POLICY", "reject_second").as_str() {
            "reject_second" => SessionPolicy::RejectSecond,
            "kick_previous" => SessionPolicy::KickPrevious,
            other => bail!("invalid SESSION_POLICY: {}", other),
        };

        let allow_no_psk = parse_bool_env("ERMETE_ALLOW_NO_PSK", false)?;
        let psk = std::env::var("ERMETE_PSK").unwrap_or_default();
        if psk.is_empty() && !allow_no_psk {
            bail!("ERMETE_PSK is required (set ERMETE_ALLOW_NO_PSK=true to run open)");
        }
        let psk_header = get_env("ERMETE_PSK_HEADER", "X-Ermete-PSK");
        if psk_header.trim().is_empty() {
            bail!("ERMETE_PSK_HEADER must not be empty");
        }

        let rate_limit_max_entries = parse_int_env("RATE_LIMIT_MAX_ENTRIES", 10_000)?;
        if rate_limit_max_entries <= 0 {
            bail!("RATE_LIMIT_MAX_ENTRIES must be > 0");
        }
        let idempotency_max = parse_int_env("IDEMPOTENCY_MAX", 50_000)?;
        if idempotency_max <= 0 {
            bail!("IDEMPOTENCY_MAX must be > 0");
        }

        let log_level = get_env("LOG_LEVEL", "info").to_lowercase();
        match log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("invalid LOG_LEVEL: {}", other),
        }

        Ok(Self {
            http_addr: get_env("HTTP_ADDR", ":8080"),
            data_dir: get_env("DATA_DIR", "/data"),
            max_upload_mb,
            cors_allowed_origins: split_csv(&std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default()),
            session_policy,
            log_level,
            tls_cert_file: std::env::var("TLS_CERT_FILE").unwrap_or_default(),
            tls_key_file: std::env::var("TLS_KEY_FILE").unwrap_or_default(),

            psk,
            psk_header,
            psk_allow_query: parse_bool_env("ERMETE_PSK_ALLOW_QUERY", false)?,

            ws_allowed_origins: split_csv(&std::env::var("WS_ALLOWED_ORIGINS").unwrap_or_default()),
            ws_allow_no_origin: parse_bool_env("WS_ALLOW_NO_ORIGIN", true)?,
            ws_allow_any_origin: parse_bool_env("WS_ALLOW_ANY_ORIGIN", false)?,

            read_header_timeout: parse_duration_env("READ_HEADER_TIMEOUT", Duration::from_secs(10))?,
            read_timeout: parse_duration_env("READ_TIMEOUT", Duration::from_secs(30))?,
            write_timeout: parse_duration_env("WRITE_TIMEOUT", Duration::from_secs(30))?,
            idle_timeout: parse_duration_env("IDLE_TIMEOUT", Duration::from_secs(120))?,
            shutdown_grace: parse_duration_env("SHUTDOWN_GRACE", Duration::from_secs(15))?,

            upload_rate_per_sec: parse_float_env("UPLOAD_RATE_PER_SEC", 2.0)?,
            upload_rate_burst: parse_int_env("UPLOAD_RATE_BURST", 5)? as u32,
            ws_rate_per_sec: parse_float_env("WS_RATE_PER_SEC", 1.0)?,
            ws_rate_burst: parse_int_env("WS_RATE_BURST", 2)? as u32,
            rate_limit_max_entries: rate_limit_max_entries as usize,
            rate_limit_ttl: parse_duration_env("RATE_LIMIT_TTL", Duration::from_secs(30 * 60))?,

            idempotency_ttl: parse_duration_env("IDEMPOTENCY_TTL", Duration::from_secs(10 * 60))?,
            idempotency_max: idempotency_max as usize,

            webrtc_stun_urls: split_csv(&std::env::var("WEBRTC_STUN_URLS").unwrap_or_default()),
            webrtc_turn_urls: split_csv(&std::env::var("WEBRTC_TURN_URLS").unwrap_or_default()),
            webrtc_turn_user: std::env::var("WEBRTC_TURN_USER").unwrap_or_default(),
            webrtc_turn_pass: std::env::var("WEBRTC_TURN_PASS").unwrap_or_default(),
        })
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb as usize * 1024 * 1024
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn parse_int_env(key: &str, fallback: i64) -> Result<i64> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse::<i64>()
            .with_context(|| format!("invalid {}: {}", key, raw)),
        _ => Ok(fallback),
    }
}

fn parse_float_env(key: &str, fallback: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {}: {}", key, raw)),
        _ => Ok(fallback),
    }
}

fn parse_bool_env(key: &str, fallback: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("invalid {}: {}", key, other),
        },
        _ => Ok(fallback),
    }
}

fn parse_duration_env(key: &str, fallback: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => {
            parse_duration(&raw).with_context(|| format!("invalid {}: {}", key, raw))
        }
        _ => Ok(fallback),
    }
}

/// Parse `90`, `90s`, `10m`, `2h`, or `500ms` into a duration.
fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (num, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: f64 = num.parse().with_context(|| format!("bad number: {}", num))?;
    if value < 0.0 {
        bail!("negative duration");
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => bail!("unknown duration unit: {}", other),
    };
    Ok(Duration::from_secs_f64(secs))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(
            split_csv("https://a.example, https://b.example ,,"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn duration_accepts_suffixes_and_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
