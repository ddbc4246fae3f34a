//! Training Worker (chorus-tr) - Main entry point
//!
//! Runs the training-job consumer and the dispatcher that feeds it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_common::blob::FsBlobStore;
use chorus_common::bus::InProcessBus;
use chorus_common::config::ChorusConfig;
use chorus_tr::dispatch::Dispatcher;
use chorus_tr::runner::TrainingRunner;

/// Command-line arguments for chorus-tr
#[derive(Parser, Debug)]
#[command(name = "chorus-tr")]
#[command(about = "Model training worker for Chorus")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the health endpoint
    #[arg(short, long, default_value = "5752", env = "CHORUS_TR_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus_tr=debug,chorus_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting chorus-tr (model training worker)");
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
    let publisher: Arc<dyn chorus_common::bus::Publisher> = Arc::new(bus.clone());
    let blob = Arc::new(FsBlobStore::new(config.blob_root.clone()));

    let runner = TrainingRunner::new(
        db.clone(),
        bus.clone(),
        publisher.clone(),
        blob,
        config.clone(),
    );
    let dispatcher = Dispatcher::new(db, publisher, config);

    // Health endpoint
    let health = chorus_common::health::health_router("chorus-tr", env!("CARGO_PKG_VERSION"));
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
        result = runner.run() => {
            result.context("training runner stopped")?;
        }
        _ = dispatcher.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
