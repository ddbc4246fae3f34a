//! Anomaly Detection Worker (chorus-ad) - Main entry point
//!
//! Consumes item IDs from the inference topic, defers items whose epoch
//! model is not ready, and merges detections for the rest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_ad::worker::InferenceWorker;
use chorus_common::blob::FsBlobStore;
use chorus_common::bus::InProcessBus;
use chorus_common::config::ChorusConfig;

/// Command-line arguments for chorus-ad
#[derive(Parser, Debug)]
#[command(name = "chorus-ad")]
#[command(about = "Anomaly detection inference worker for Chorus")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the health endpoint
    #[arg(short, long, default_value = "5751", env = "CHORUS_AD_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus_ad=debug,chorus_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting chorus-ad (anomaly detection worker)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ChorusConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    info!("Database: {}", config.database_path.display());
    info!("Blob root: {}", config.blob_root.display());

    let db = chorus_common::db::init_pool(&config.database_path)
        .await
        .context("failed to open database")?;
    info!("Database connection established");

    let bus = InProcessBus::new();
    let blob = Arc::new(FsBlobStore::new(config.blob_root.clone()));

    let worker = InferenceWorker::new(db, bus, blob, config);

    // Health endpoint
    let health = chorus_common::health::health_router("chorus-ad", env!("CARGO_PKG_VERSION"));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .context("failed to bind health endpoint")?;
    info!("Health check: http://127.0.0.1:{}/health", args.port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health).await {
            tracing::error!(error = %e, "health endpoint stopped");
        }
    });

    tokio::select! {
        result = worker.run() => {
            result.context("inference worker stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
