//! Multi-account proxy gateway.
//!
//! Wires the Store, Token Manager, Account Pool, Rate Limiter, Upstream
//! Client, and Model Logger into a `GatewayState`, then serves two
//! listeners: the caller-facing chat-completion/content-generation API and
//! a separate admin API for account lifecycle and operational endpoints.

mod admin;
mod config;
mod error;
mod handlers;
mod metrics;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use account_pool::{Pool, PoolConfig};
use anyhow::{Context, Result};
use axum::Router;
use axum::routing::post;
use gateway_core::{DispatchConfig, GatewayState, ModelLogger, RateLimiter};
use store::Store;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use token_manager::{TokenManager, TokenManagerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream_client::UpstreamClient;

use crate::config::Config;

/// State handed to every caller-facing HTTP handler.
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)).map(String::as_str);
    let config_path = Config::resolve_path(cli_config_path);
    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(path = %config_path.display(), "loading configuration");
    info!(listen_addr = %config.listen_addr, admin_listen_addr = %config.admin_listen_addr, "configuration loaded");

    let metrics_handle = metrics::install_recorder();

    if let Some(dir) = config.store_path.parent() {
        tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating store directory {}", dir.display()))?;
    }
    let store = Arc::new(Store::load(config.store_path.clone(), config.request_log_retention).await?);

    let mut http_builder = reqwest::Client::builder().connect_timeout(Duration::from_millis(config.fetch_connect_timeout_ms));
    if let Some(proxy_url) = &config.outbound_proxy_url {
        http_builder = http_builder.proxy(reqwest::Proxy::all(proxy_url).with_context(|| format!("invalid outboundProxyUrl {proxy_url}"))?);
    }
    let http = http_builder.build().context("building upstream HTTP client")?;

    let token_manager = Arc::new(TokenManager::new(
        store.clone(),
        http.clone(),
        TokenManagerConfig { skew_ms: config.token_refresh_skew_ms, ..TokenManagerConfig::default() },
    ));

    let pool = Arc::new(Pool::new(
        store.clone(),
        token_manager.clone(),
        PoolConfig {
            error_threshold: config.error_threshold,
            account_wait: Duration::from_millis(config.account_wait_ms),
            preferred_tiers: config.preferred_tiers.clone(),
        },
    ));

    let limiter = Arc::new(RateLimiter::new(config.default_model_concurrency, config.model_concurrency.clone()));
    let upstream = Arc::new(UpstreamClient::new(http.clone(), config.upstream_endpoint.clone()));
    let model_logger = Arc::new(ModelLogger::new(config.model_log_capacity));

    let dispatch_config = Arc::new(DispatchConfig {
        capacity_retries: config.capacity_retries,
        capacity_retry_delay: Duration::from_millis(config.capacity_retry_delay_ms),
        model_aliases: config.model_aliases.clone(),
    });

    let gateway = GatewayState {
        store: store.clone(),
        token_manager: token_manager.clone(),
        pool: pool.clone(),
        limiter,
        upstream,
        model_logger,
        config: dispatch_config,
    };

    let shutdown = CancellationToken::new();
    let app_state = AppState { gateway, shutdown: shutdown.clone() };

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1beta/models/{*model_and_action}", post(handlers::generate_content))
        .with_state(app_state);

    let requests_total = Arc::new(AtomicU64::new(0));
    let admin_state = admin::AdminState::new(store, pool, token_manager, metrics_handle, requests_total);
    let admin_app = admin::build_admin_router(admin_state);

    let listener = TcpListener::bind(config.listen_addr).await.with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin_listen_addr).await.with_context(|| format!("failed to bind to {}", config.admin_listen_addr))?;

    info!(addr = %config.listen_addr, "listening");
    info!(addr = %config.admin_listen_addr, "admin listening");

    let shutdown_for_main = shutdown.clone();
    let main_server = axum::serve(listener, app).with_graceful_shutdown(async move { shutdown_for_main.cancelled().await });
    let shutdown_for_admin = shutdown.clone();
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(async move { shutdown_for_admin.cancelled().await });

    tokio::select! {
        result = main_server => result.context("main server error")?,
        result = admin_server => result.context("admin server error")?,
        _ = shutdown_signal() => {
            shutdown.cancel();
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
