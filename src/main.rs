//! Resilience engine host.
//!
//! Loads a policy configuration, builds the pipeline and serves the
//! health/admin router until SIGINT or SIGTERM, then drains detached
//! operations.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;

use resilience_engine::admin::setup_admin_router;
use resilience_engine::config::{load_config, EngineConfig};
use resilience_engine::lifecycle::{drain_detached, signals, Shutdown};
use resilience_engine::observability::{logging, metrics};
use resilience_engine::{HealthReporter, Pipeline};

#[derive(Parser)]
#[command(name = "resilience-engine")]
#[command(about = "Resilience policy engine with health and admin endpoints", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_logging(level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resilience-engine starting");

    let health = HealthReporter::new();
    match run(config, health.clone()).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            health.mark_fatal(&e.to_string());
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: EngineConfig, health: HealthReporter) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    let pipeline = Pipeline::with_health(config.clone(), health)?;

    let shutdown = Shutdown::new();
    let signal_task = tokio::spawn(signals::wait_for_shutdown(shutdown.clone()));

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Health and admin endpoints listening");

        let router = setup_admin_router(pipeline.clone(), &config.admin);
        let stop = shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                stop.triggered().await;
            })
            .await?;
    } else {
        tracing::info!("Admin router disabled, waiting for shutdown signal");
        shutdown.triggered().await;
    }
    signal_task.abort();

    let abandoned = drain_detached(&pipeline, config.lifecycle.drain_timeout()).await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "Exiting with detached operations still running");
    }
    Ok(())
}
