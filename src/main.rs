mod config;
mod discovery;
mod entity;
mod error;
mod hardware;
mod heartbeat;
mod lifecycle;
mod mqtt;
mod registry;
mod sync;
mod topics;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use config::Config;
use lifecycle::Bridge;
use mqtt::RumqttConnector;

const CONFIG_ENV: &str = "PULSEBRIDGE_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pulsebridge=debug")),
        )
        .init();

    tracing::info!("Starting pulsebridge v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    // Installed before startup so a signal received while starting is
    // honoured as soon as the bridge is ready.
    let termination = termination_signal().context("installing signal handlers")?;

    let path = config_path();
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let hardware = hardware::from_config(&config.hardware);
    let connector = RumqttConnector::from_config(&config);

    let bridge = Bridge::start(&config, hardware.as_ref(), &connector)
        .await
        .context("startup failed")?;

    termination.await;
    bridge.shutdown().await;
    tracing::info!("Exiting ({:?})", bridge.state());
    Ok(())
}

/// First CLI argument, else `$PULSEBRIDGE_CONFIG`, else `pulsebridge.yaml`.
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("pulsebridge.yaml"))
}

/// Resolves on the first SIGINT or SIGTERM.
#[cfg(unix)]
fn termination_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("SIGINT received"),
            _ = terminate.recv() => tracing::info!("SIGTERM received"),
        }
    })
}

#[cfg(not(unix))]
fn termination_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Waiting for Ctrl-C failed: {}", e);
        }
    })
}
