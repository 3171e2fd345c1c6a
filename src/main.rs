mod api;
mod clock;
mod config;
mod context;
mod error;
mod gateway;
mod metrics;
mod middleware;
mod ratelimit;
mod upstream;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    clock::SystemClock,
    config::{GatewayConfig, LogFormat, RateLimitBackendConfig, RateLimitConfig},
    metrics::RateLimitMetrics,
    ratelimit::{
        FailurePolicy,
        RateLimiter,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
        store::CounterStore,
        window::WindowTracker,
    },
    upstream::ScannerUpstream,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let metrics = Arc::new(RateLimitMetrics::new());

    let limiter = if cfg.rate_limit.enabled {
        Some(build_limiter(&cfg.rate_limit, metrics.clone()).await?)
    } else {
        tracing::warn!("rate limiting disabled; all requests pass through unmetered");
        None
    };

    let scanner = Arc::new(ScannerUpstream::new(&cfg.scanner).map_err(|e| anyhow::anyhow!(e.message()))?);
    let gateway = Arc::new(Gateway::new(&cfg, limiter.clone(), metrics.clone(), scanner));

    let app = api::routes(&cfg, gateway, limiter, metrics);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, scanner = %cfg.scanner.base_url, "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn build_limiter(cfg: &RateLimitConfig, metrics: Arc<RateLimitMetrics>) -> anyhow::Result<RateLimiter> {
    let clock = Arc::new(SystemClock);

    let store: Arc<dyn CounterStore> = match &cfg.backend {
        RateLimitBackendConfig::InMemory => {
            tracing::warn!("using in-memory rate limit store; limits are per instance");
            Arc::new(InMemoryCounterStore::new(clock.clone()))
        }
        RateLimitBackendConfig::Redis {
            url,
            connect_timeout_ms,
        } => {
            let store = RedisCounterStore::connect(url, Duration::from_millis(*connect_timeout_ms))
                .await
                .context("failed to connect to rate limit store")?;
            tracing::info!("connected to redis rate limit store");
            Arc::new(store)
        }
    };

    let failure_policy = if cfg.fail_open_on_error {
        FailurePolicy::FailOpen
    } else {
        FailurePolicy::FailClosed
    };
    tracing::info!(
        store = store.name(),
        burst = cfg.burst_allowance,
        policy = ?failure_policy,
        "rate limiter ready"
    );

    let tracker = WindowTracker::new(
        store,
        cfg.key_prefix.clone(),
        Duration::from_millis(cfg.store_timeout_ms),
    );
    Ok(RateLimiter::new(
        tracker,
        clock,
        cfg.burst_allowance,
        failure_policy,
        metrics,
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received; draining connections");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}
