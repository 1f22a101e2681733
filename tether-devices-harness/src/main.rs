mod device;
mod live;
mod poll;

use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::eyre::ensure;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tether-devices-harness")]
#[command(about = "Simulate a fleet of devices against a tether-hub")]
struct Cli {
    /// Path to the harness configuration file
    #[arg(short, long, default_value = "tether-devices-harness.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Devices holding a live WebSocket.
    device_count: usize,
    /// Devices reaching the hub only through the poll endpoint.
    #[serde(default)]
    poll_device_count: usize,
    hub_ws_url: String,
    hub_http_url: String,
    reading_interval_secs: u64,
    heartbeat_interval_secs: u64,
    poll_interval_secs: u64,
}

impl HarnessConfig {
    fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: HarnessConfig = toml::from_str(&content)?;

        ensure!(
            config.reading_interval_secs > 0
                && config.heartbeat_interval_secs > 0
                && config.poll_interval_secs > 0,
            "intervals must be at least one second"
        );
        config.hub_http_url = config.hub_http_url.trim_end_matches('/').to_owned();

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,tether_devices_harness=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading harness configuration");
        HarnessConfig::load(&cli.config)?
    } else {
        return Err(color_eyre::eyre::eyre!(
            "Configuration file not found: {:?}",
            cli.config
        ));
    };

    info!(
        device_count = config.device_count,
        poll_device_count = config.poll_device_count,
        hub_ws_url = %config.hub_ws_url,
        hub_http_url = %config.hub_http_url,
        "Starting devices harness"
    );

    let cancel = CancellationToken::new();
    let mut devices = JoinSet::new();

    for i in 0..config.device_count {
        let device_id = format!("ws-device-{i:04}");
        devices.spawn(live::run(device_id, config.clone(), cancel.clone()));
    }
    for i in 0..config.poll_device_count {
        let device_id = format!("poll-device-{i:04}");
        devices.spawn(poll::run(device_id, config.clone(), cancel.clone()));
    }

    info!(spawned = devices.len(), "All devices launched");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, stopping all devices...");
    cancel.cancel();

    while let Some(result) = devices.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Device task failed");
        }
    }

    info!("Harness shutdown complete");
    Ok(())
}
