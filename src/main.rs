//! Carousel - Entry Point
//!
//! Wires the pool, the probe and the snapshot flusher together, then runs
//! until a shutdown signal arrives.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carousel::collab::{HttpChecker, MemoryStats};
use carousel::config::PersistConfig;
use carousel::models::Entry;
use carousel::persist;
use carousel::pool::PoolBuilder;
use carousel::probe::{ProbeBuilder, ProbeSnapshot};
use carousel::{Config, Pool, Probe, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("Starting Carousel");

    let (heartbeat, dirty) = persist::notify_heartbeat();

    let pool = PoolBuilder::from_config(&config.pool)
        .heartbeat(heartbeat.clone())
        .build();

    let checker = Arc::new(HttpChecker::new(
        config.probe.check_url.clone(),
        config.probe.check_timeout,
    ));
    let stats = Arc::new(MemoryStats::new());
    let probe = ProbeBuilder::from_config(&config.probe, pool.clone(), checker, stats)
        .heartbeat(heartbeat)
        .build();

    restore_snapshots(&pool, &probe, &config.persist).await?;

    // Debounced flusher: a heartbeat marks state dirty, the actual write
    // happens at most once per debounce window.
    let flusher = tokio::spawn(flush_loop(
        pool.clone(),
        probe.clone(),
        config.persist.clone(),
        dirty,
    ));

    shutdown_signal().await;
    info!("Shutdown signal received");

    flusher.abort();
    if let Err(e) = flush(&pool, &probe, &config.persist).await {
        error!("Final snapshot flush failed: {}", e);
    }

    probe.shutdown();
    pool.shutdown();

    info!("Carousel stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("carousel={}", config.log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn restore_snapshots(pool: &Pool, probe: &Probe, config: &PersistConfig) -> Result<()> {
    if let Some(entries) = persist::load_snapshot::<Vec<Entry>>(&config.pool_path)? {
        let count = entries.len();
        for entry in entries {
            pool.add(entry).await?;
        }
        info!("Restored {} pool entries", count);
    }

    if let Some(snapshot) = persist::load_snapshot::<ProbeSnapshot>(&config.probe_path)? {
        probe.restore(snapshot).await?;
        info!("Restored probe lifecycle snapshot");
    }
    Ok(())
}

async fn flush_loop(pool: Pool, probe: Probe, config: PersistConfig, dirty: Arc<Notify>) {
    loop {
        dirty.notified().await;
        tokio::time::sleep(config.flush_debounce).await;
        if let Err(e) = flush(&pool, &probe, &config).await {
            warn!("Snapshot flush failed: {}", e);
        }
    }
}

async fn flush(pool: &Pool, probe: &Probe, config: &PersistConfig) -> Result<()> {
    let entries = pool.snapshot().await?;
    persist::save_snapshot(&config.pool_path, &entries)?;

    let snapshot = probe.snapshot().await?;
    persist::save_snapshot(&config.probe_path, &snapshot)?;
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
