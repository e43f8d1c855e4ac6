use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::time::Duration;
use tidepool_controller::config::{Config, LogFormat, LoggingConfig};
use tidepool_controller::server::{AppState, run_sweeper};
use tidepool_controller::{dashboard, router};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DASHBOARD_INTERVAL: Duration = Duration::from_secs(2);
/// Time given to queued stop commands to reach the workers on exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Fleet controller: keeps aggregate worker throughput near the configured target
#[derive(Debug, Parser)]
#[command(name = "tidepool-controller", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        short,
        long,
        env = "TIDEPOOL_CONFIG",
        default_value = "config/controller.yaml"
    )]
    config: PathBuf,

    /// Print a live dashboard to the terminal
    #[arg(long)]
    dashboard: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tidepool_controller={},tower_http=info",
            logging.level
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    let _ = tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_tracing(&config.logging);
    info!(
        path = %cli.config.display(),
        workers = config.workers.len(),
        target_gbps = config.throughput.target_gbps,
        "Loaded configuration"
    );
    if config.server.auth_token.is_empty() {
        info!("No auth token configured, worker connections are unauthenticated");
    }

    // Must be installed before anything records a metric
    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let addr = config.bind_addr();
    let snapshot_interval = Duration::from_secs(config.metrics.snapshot_interval_secs);
    let stale_after = Duration::from_secs(config.metrics.stale_after_secs);
    let state = AppState::new(config).with_prometheus(prometheus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx.clone()));

    let scheduler = state.scheduler.clone();
    let scheduler_rx = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    tokio::spawn(
        state
            .aggregator
            .clone()
            .run_snapshots(snapshot_interval, shutdown_rx.clone()),
    );
    tokio::spawn(run_sweeper(
        state.clone(),
        SWEEP_INTERVAL,
        stale_after,
        shutdown_rx.clone(),
    ));
    if cli.dashboard {
        tokio::spawn(dashboard::run(
            state.clone(),
            DASHBOARD_INTERVAL,
            shutdown_rx.clone(),
        ));
    }

    let connections = state.connections.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Tidepool controller listening on {}", addr);

    let mut serve_rx = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_rx.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| {
            error!("Server error: {}", e);
            e
        })?;

    // Server may also exit without the signal
    let _ = shutdown_tx.send(true);
    scheduler_task.await?;
    if !connections.flush(SHUTDOWN_GRACE).await {
        warn!("Some stop commands were still queued when the grace period ended");
    }
    info!("Controller stopped");
    Ok(())
}
