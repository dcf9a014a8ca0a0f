//! Main entry point for the hydrotier engine
//! Loads configuration, opens the stores and runs the background loops until
//! interrupted.

use anyhow::{Context, Result};
use hydrotier::observability::{init_observability, ObservabilityConfig, ObservabilityGuard};
use hydrotier::{Engine, EngineConfig};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("HYDROTIER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("hydrotier.toml"));
    let config = EngineConfig::load(Some(&config_path))
        .with_context(|| format!("Invalid configuration ({})", config_path.display()))?;

    // RUST_LOG still wins over the configured level
    let _observability_guard = init_observability(Some(ObservabilityConfig {
        default_filter: config.log_level.0.clone(),
        ..Default::default()
    }))
    .unwrap_or_else(|e| {
        eprintln!("Warning: Failed to initialize observability: {}", e);
        eprintln!("Continuing without OpenTelemetry tracing...");
        ObservabilityGuard::default()
    });

    if config_path.exists() {
        tracing::info!("Loaded config from {}", config_path.display());
    } else {
        tracing::info!("Using default config");
    }

    tracing::info!("Starting hydrotier engine");
    let engine = Engine::open(config).await?;
    engine.start().await;

    tracing::info!("All components started - awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    engine.shutdown().await;
    Ok(())
}
