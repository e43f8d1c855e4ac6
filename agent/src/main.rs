use clap::Parser;
use std::path::PathBuf;
use tidepool_agent::config::{Config, LogFormat, LoggingConfig};
use tidepool_agent::Agent;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Worker agent: runs load commands issued by a tidepool controller
#[derive(Debug, Parser)]
#[command(name = "tidepool-agent", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TIDEPOOL_AGENT_CONFIG", default_value = "config/agent.yaml")]
    config: PathBuf,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tidepool_agent={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_tracing(&config.logging);
    info!(
        agent_id = %config.agent.id,
        controller = %config.controller.url,
        "Starting tidepool agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    Agent::new(config).run(shutdown_rx).await?;
    Ok(())
}
