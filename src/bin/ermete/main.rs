//! Ermete server binary
//!
//! Loads configuration from the environment, wires the store, session
//! manager, rate limiter, and WebRTC service into the axum router, and
//! serves until SIGINT/SIGTERM. Shutdown drains in-flight requests up to
//! `SHUTDOWN_GRACE`, then force-closes.
//!
//! ```bash
//! ERMETE_PSK=secret DATA_DIR=/var/lib/ermete ermete
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ermete::config::Config;
use ermete::metrics::Metrics;
use ermete::rtc::RtcService;
use ermete::session::SessionManager;
use ermete::storage::FrameStore;
use ermete::web::rate_limit::RateLimiter;
use ermete::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(&config.log_level)?;

    info!("ermete starting");
    info!("  addr: {}", config.http_addr);
    info!("  data dir: {}", config.data_dir);
    info!("  session policy: {:?}", config.session_policy);
    info!("  max upload: {} MB", config.max_upload_mb);

    let metrics = Arc::new(Metrics::new()?);
    let store = FrameStore::new(
        &config.data_dir,
        config.idempotency_ttl,
        config.idempotency_max,
        metrics.clone(),
    )
    .context("init frame store")?;
    let sessions = Arc::new(SessionManager::new(config.session_policy));
    let limits = RateLimiter::new(
        config.rate_limit_ttl,
        config.rate_limit_max_entries,
        metrics.clone(),
    );
    let rtc = Arc::new(RtcService::new(
        config.clone(),
        metrics.clone(),
        sessions.clone(),
        store.clone(),
    )?);

    if !config.tls_cert_file.is_empty() || !config.tls_key_file.is_empty() {
        warn!("TLS_CERT_FILE/TLS_KEY_FILE set: TLS is terminated by the fronting proxy, not in-process");
    }

    let shutdown_grace = config.shutdown_grace;
    let addr = resolve_addr(&config.http_addr)?;
    let state = Arc::new(AppState {
        config,
        metrics,
        store,
        sessions,
        rtc,
        limits,
    });
    let app = web::router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("ermete listening on http://{}", addr);

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(server_cancel.cancelled_owned())
        .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("server task")??;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    cancel.cancel();
    match tokio::time::timeout(shutdown_grace, &mut server).await {
        Ok(result) => result.context("server task")??,
        Err(_) => {
            warn!(grace = ?shutdown_grace, "shutdown grace expired, forcing close");
            server.abort();
        }
    }
    info!("server stopped");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_default()
        .add_directive(format!("ermete={}", level).parse().context("log directive")?);
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Accept `:8080` (all interfaces) as well as full `host:port` forms.
fn resolve_addr(raw: &str) -> Result<SocketAddr> {
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid HTTP_ADDR: {}", raw))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
