use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use crate::config::{ServerConfig, StoreBackend};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{MemoryStore, RedisStore, SharedStoreHandle};

pub async fn connect_store(backend: &StoreBackend) -> Result<SharedStoreHandle> {
    match backend {
        StoreBackend::Redis { url } => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("failed to connect to redis at {url}"))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => Ok(MemoryStore::new()),
    }
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let store = connect_store(&config.store).await?;
    let mut state = AppState::new(
        store,
        &config.service,
        config.auth.clone(),
        config.instance_id.clone(),
    );
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    // Sockets accepted before the fanout subscription exists would miss
    // execute frames, so subscribe before binding.
    let fanout_task = state
        .fanout
        .start()
        .await
        .context("failed to subscribe to fanout topic")?;

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(instance_id = %config.instance_id, "beach-dispatch listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    fanout_task.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
