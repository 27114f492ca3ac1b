//! FxRelay node binary
//!
//! Reads raw ticks as JSON lines from stdin and publishes rate snapshots.

use std::sync::Arc;

use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fxrelay_node::{ingest, NodeConfig, RateService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = NodeConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting FxRelay node");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| format!("fxrelay-{}", uuid::Uuid::new_v4()));

    info!(node_id = %node_id, "Node ID assigned");

    let service = Arc::new(RateService::new(config.clone(), node_id.clone())?);
    service.start().await?;

    info!(
        node_id = %node_id,
        rules_path = %config.rules_path.display(),
        script_root = %config.script_root.display(),
        workers = config.workers,
        "Node running"
    );

    let ingest_service = Arc::clone(&service);
    let mut ingest_task = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        ingest::run_json_lines(&ingest_service, stdin).await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut ingest_task => {
            match result {
                Ok(Ok(summary)) => info!(
                    lines = summary.lines,
                    malformed = summary.malformed,
                    triggered = summary.triggered,
                    "Tick input exhausted"
                ),
                Ok(Err(e)) => error!(error = %e, "Tick ingestion failed"),
                Err(e) => error!(error = %e, "Tick ingestion task aborted"),
            }
        }
    }

    if let Err(e) = service.stop().await {
        error!(error = %e, "Error during shutdown");
    }
    ingest_task.abort();

    info!(node_id = %node_id, "Node shutdown complete");
    Ok(())
}
