//! Iris agent entrypoint

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use iris::{Agent, AgentSettings, CommonSettings};

#[derive(Parser)]
#[command(name = "iris-agent")]
#[command(about = "Iris probing agent")]
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

    let settings = AgentSettings::from_env();
    let common = CommonSettings::from_env();
    tracing::info!(agent_uuid = %settings.agent_uuid, "starting agent");

    let agent = Agent::new(settings, common).await?;
    tokio::select! {
        result = agent.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            agent.deregister().await?;
        }
    }
    Ok(())
}
