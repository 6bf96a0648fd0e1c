//! statekeeper - State machine engine daemon
//!
//! Loads a schema, opens the data directory and fires due timeouts until stopped.

use statekeeper_runtime::{Config, Runtime, SweepScheduler};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if STATEKEEPER_CONFIG is set, then env overrides)
    let config_path = std::env::var("STATEKEEPER_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    tracing::info!("Starting statekeeper");
    match &config.schema.path {
        Some(path) => tracing::info!("  Schema: {}", path.display()),
        None => {
            tracing::error!("schema.path is not set (use STATEKEEPER_SCHEMA)");
            return Err("No schema configured".into());
        }
    }
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  Fsync policy: {:?}", config.storage.fsync_policy);
    tracing::info!(
        "  Journal: {}",
        if config.journal.enabled { "enabled" } else { "disabled" }
    );
    if config.authorization.is_empty() {
        tracing::info!("  Authorization: none (permission checks deny)");
    } else {
        tracing::info!(
            "  Authorization: {} role(s)",
            config.authorization.roles.len()
        );
    }
    if config.sweep.is_disabled() {
        tracing::info!("  Timeout sweep: disabled");
    } else {
        tracing::info!("  Timeout sweep: every {}s", config.sweep.interval_secs);
    }

    let runtime = Runtime::open(config)?;
    for name in runtime.machine_names() {
        tracing::info!("  Machine: {}", name);
    }

    // Spawn the timeout scheduler
    let scheduler = Arc::new(SweepScheduler::for_runtime(&runtime));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run().await;
        })
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal, stopping...");
    scheduler.shutdown();
    let _ = scheduler_handle.await;

    let stats = scheduler.stats();
    tracing::info!(
        "Sweeps: {} pass(es), {} triggered, {} failure(s)",
        stats.passes,
        stats.triggered,
        stats.failures
    );

    // Flush storage before exit
    if let Err(e) = runtime.sync() {
        tracing::error!("Failed to sync storage on shutdown: {}", e);
    }

    tracing::info!("statekeeper stopped");
    Ok(())
}
