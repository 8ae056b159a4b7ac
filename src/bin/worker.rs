//! Iris worker entrypoint

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use iris::{CommonSettings, Worker, WorkerSettings};

#[derive(Parser)]
#[command(name = "iris-worker")]
#[command(about = "Iris round pipeline worker")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `info` or `iris=debug`
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let settings = WorkerSettings::from_env();
    let common = CommonSettings::from_env();
    tracing::info!("starting worker");

    let worker = Arc::new(Worker::new(settings, common).await?);
    tokio::select! {
        result = worker.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    Ok(())
}
