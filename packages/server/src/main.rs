mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use engine::{EngineConfig, RuntimeRegistry, SandboxPool};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load().context("Failed to load config")?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let registry = RuntimeRegistry::load(Path::new(&config.runtimes_dir), &config);
    if registry.is_empty() {
        warn!(dir = %config.runtimes_dir, "no runtimes installed; every init will fail");
    } else {
        info!(count = registry.len(), "runtimes loaded");
    }

    let config = Arc::new(config);
    let pool = SandboxPool::new(&config);
    let state = AppState {
        config: Arc::clone(&config),
        registry: Arc::new(registry),
        pool,
    };

    let app = Router::new()
        .route("/judge", get(handlers::judge::judge))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.bind_addr))?;
    info!("Judge listening on ws://{addr}/judge");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Stop accepting sockets on SIGTERM or ctrl-c; in-flight sessions drive
/// their own cleanup.
async fn shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}
