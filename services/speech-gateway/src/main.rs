//! Speech gateway
//!
//! Single-binary service that fronts a quota-constrained upstream speech
//! API with a pool of rate-limited API keys:
//! 1. Loads configured keys into the shared key store
//! 2. Serves POST /v1/audio/speech, rotating and retrying across keys
//! 3. Exposes pool health on /health and Prometheus metrics on /metrics

mod config;
mod metrics;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_backend::HttpSpeechBackend;
use voice_keys::JsonFileStore;
use voice_pool::{KeyPool, RetryPolicy, SpeechService};

use crate::config::Config;
use crate::routes::{AppState, health_handler, metrics_handler, speech_handler};

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit layer bounds in-flight requests so a saturated
/// upstream can't pile up unbounded retry loops.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/audio/speech", post(speech_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting speech-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        default_model = %config.upstream.default_model,
        "configuration loaded"
    );

    let store = Arc::new(
        JsonFileStore::load(config.pool.store_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to load key store from {}",
                    config.pool.store_path.display()
                )
            })?,
    );

    let pool = Arc::new(KeyPool::new(store));
    match &config.pool.api_keys {
        Some(keys) => {
            pool.initialize(keys.expose(), config.pool.limits())
                .await
                .context("failed to initialize key pool")?;
        }
        None => {
            warn!("no api keys configured (SPEECH_API_KEYS / api_keys_file), pool may be empty");
        }
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()
        .context("failed to build http client")?;
    let backend = Arc::new(HttpSpeechBackend::new(
        client,
        config.upstream.base_url.clone(),
    ));

    let policy = RetryPolicy {
        initial_delay: Duration::from_millis(config.pool.initial_delay_ms),
        max_delay: Duration::from_millis(config.pool.max_delay_ms),
        max_retries: config.pool.max_retries,
    };
    let service = Arc::new(SpeechService::new(pool, backend, policy));

    let state = AppState {
        service,
        default_model: config.upstream.default_model.clone(),
        prometheus,
    };
    let router = build_router(state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(listen_addr = %config.server.listen_addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("speech-gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, draining");
}
