use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

use tether_relay::{
    app, build_registry,
    cli::{run_probe, Cli, Commands},
    config::RelayConfig,
    relay_state,
    telemetry::{init_tracing, Telemetry},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe { url, token }) = cli.command {
        init_tracing("warn")?;
        return run_probe(url, token).await;
    }

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        jwks = config.authorizer.jwks_url.is_some(),
        "starting tether relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = build_registry(&config).await?;
    let state = relay_state(&config, registry);

    if config.authorizer.jwks_url.is_some() {
        let authorizer = state.authorizer.clone();
        tokio::spawn(async move {
            match authorizer.refresh().await {
                Ok(keys) => info!(keys, "jwks loaded"),
                Err(err) => warn!(error = %err, "initial jwks fetch failed; retrying on demand"),
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("tether relay listening on {}", config.listen_addr);

    axum::serve(listener, app(state, metrics))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
