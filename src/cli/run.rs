use crate::config::parse::load_config;
use crate::config::{system_config_path, user_config_path};
use crate::pipeline::{Bridge, PipelineError};
use crate::publisher::{build_broker, BrokerError};
use crate::source::{build_source, SourceError};
use crate::storage::{DuckDbStore, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("config not found")]
    ConfigNotFound,
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        if let Some(user_config) = user_config_path() {
            eprintln!("  {}", user_config.display());
        }
        eprintln!("  {}", system_config_path().display());
        eprintln!(
            "\nUse --config <path> to specify a config file, or run 'twitter-to-kafka config init' to generate one."
        );
        return Err(RunError::ConfigNotFound.into());
    };

    run_bridge(&config_path).await.map_err(|e| e.into())
}

async fn run_bridge(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    info!(path = %config.checkpoint.path.display(), "Opening checkpoint store");
    let store = Arc::new(DuckDbStore::new(&config.checkpoint.path)?);
    let broker = build_broker(&config.broker)?;
    let source = build_source(&config.source)?;
    let grace = config.shutdown.grace_period;

    let mut bridge = Bridge::new(config, store, broker, source).start().await?;

    info!("Bridge started, press Ctrl+C to shutdown");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = bridge.wait_for_source() => {
            match result {
                Ok(summary) if summary.exhausted => {
                    info!(enqueued = summary.enqueued, "Source exhausted, draining");
                }
                Ok(summary) => info!(enqueued = summary.enqueued, "Source connector stopped"),
                Err(e) => error!(error = %e, "Source connector failed"),
            }
        }
    }

    let report = bridge.shutdown(grace).await?;

    if !report.unresolved.is_empty() {
        warn!(
            unresolved = report.unresolved.len(),
            "Records not delivered this run will be re-ingested on restart"
        );
    }
    if let Some(e) = &report.persist_error {
        error!(error = %e, "Final checkpoint could not be persisted");
    }

    info!(
        sequence = report.checkpoint.sequence,
        cursor = report.checkpoint.cursor.as_deref().unwrap_or(""),
        ingested = report.stats.ingested,
        acked = report.stats.acked,
        delivery_failures = report.stats.delivery_failures,
        corrupt_payloads = report.stats.corrupt_payloads,
        "Shutdown complete"
    );

    Ok(())
}
