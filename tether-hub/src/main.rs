use std::path::PathBuf;

use clap::Parser;
use tether_hub::{
    AppState, Config, HubStorage, MemoryStorage, SqliteStorage, StorageConfig, app, run_flush_loop,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tether-hub")]
#[command(about = "Device connectivity and command delivery hub")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tether-hub.toml")]
    config: PathBuf,

    /// Temperature change a buffered reading needs to be persisted
    #[arg(long, env = "TEMP_THRESHOLD")]
    temp_threshold: Option<f64>,

    /// Humidity change a buffered reading needs to be persisted
    #[arg(long, env = "HUMID_THRESHOLD")]
    humid_threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,tether_hub=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    config.buffer = config
        .buffer
        .with_overrides(cli.temp_threshold, cli.humid_threshold);

    info!(
        http_addr = %config.server.http_addr,
        temperature_threshold = config.buffer.temperature_threshold,
        humidity_threshold = config.buffer.humidity_threshold,
        flush_interval_secs = config.buffer.flush_interval_secs,
        "Starting tether-hub"
    );

    match config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            let storage = MemoryStorage::default();
            run_hub(config, storage).await?;
        }
        StorageConfig::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite storage");
            let storage = SqliteStorage::new(path.to_string_lossy()).await?;
            run_hub(config, storage).await?;
        }
    }

    Ok(())
}

async fn run_hub<S: HubStorage>(config: Config, storage: S) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();
    let state = AppState::new(storage, &config, cancel.clone());

    // Spawn flush task
    let flush_handle = tokio::spawn(run_flush_loop(
        state.buffer.clone(),
        config.buffer.flush_interval(),
        config.buffer.flush_on_shutdown,
        cancel.clone(),
    ));

    // HTTP server
    let http_addr = config.server.http_addr;
    let listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();

    tokio::select! {
        result = axum::serve(listener, app(state)).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Stops the flush loop and every device session
    cancel.cancel();

    // Wait for the final flush
    let _ = flush_handle.await;

    info!("tether-hub shut down complete");
    Ok(())
}
