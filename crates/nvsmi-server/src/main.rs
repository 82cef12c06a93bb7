mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use nvsmi_server::{router, serve, AppState};
use nvsmi_services::{build_source, Collector, GpuMetrics};
use tokio::net::TcpListener;
use tracing::{error, info};

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = Cli::parse().into_config()?;
    if config.test_mode {
        info!("Test mode is enabled");
    }
    let addr = config.listen_socket_addr()?;

    let metrics = GpuMetrics::new().context("Failed to register metrics")?;

    let collector = Collector::new(build_source(&config), metrics.clone(), config.collector.clone());
    let collector_task = collector.spawn();
    tokio::spawn(async move {
        if let Err(e) = collector_task.await {
            error!("SMI collector task aborted: {}", e);
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Nvidia SMI exporter listening on {}", addr);

    serve(listener, router(AppState::new(metrics))).await?;

    Ok(())
}
