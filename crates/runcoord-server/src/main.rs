//! Run coordinator server.
//!
//! Run with: cargo run -p runcoord-server
//!
//! Configuration comes from `RUNCOORD_*` environment variables. Without
//! `RUNCOORD_DATABASE_URL` the coordinator keeps everything in memory.

use std::sync::Arc;

use anyhow::Context as _;
use runcoord_coordinator::{
    Coordinator, CoordinatorConfig,
    storage::{MemoryStore, SqliteStore},
};
use runcoord_core::RunStore;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = CoordinatorConfig::from_env().context("invalid configuration")?;

    match config.database_url.clone() {
        Some(url) => {
            let store = SqliteStore::connect(&url)
                .await
                .with_context(|| format!("failed to open database {url}"))?;
            tracing::info!(%url, "Using SQLite store");
            serve(store, config).await
        }
        None => {
            tracing::warn!("No database configured, state will not survive a restart");
            serve(MemoryStore::new(), config).await
        }
    }
}

async fn serve<S: RunStore + 'static>(store: S, config: CoordinatorConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr;
    tracing::info!(
        host_id = %config.host_id,
        reaper = %config.reaper_policy,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "Coordinator configured"
    );

    let coordinator = Arc::new(Coordinator::new(store, config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = Arc::clone(&coordinator).spawn_maintenance(shutdown_rx);

    let app = runcoord_transport::router(coordinator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = maintenance.await {
        tracing::warn!("Maintenance task ended abnormally: {e}");
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
