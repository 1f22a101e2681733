pub mod cache;
pub mod commands;
pub mod devices;
pub mod error;
pub mod models;

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;
use crate::storage::HubStorage;

pub fn router<S: HubStorage>() -> Router<AppState<S>> {
    Router::new()
        // Command delivery
        .route("/commands", post(commands::submit_command::<S>))
        .route("/commands/poll", get(commands::poll_commands::<S>))
        .route("/command-responses", post(commands::acknowledge::<S>))
        // Devices
        .route("/devices/connected", get(devices::connected_devices::<S>))
        .route("/devices/{id}/change-wifi", post(commands::change_wifi::<S>))
        // Telemetry buffer
        .route("/cache/process", post(cache::process::<S>))
        .route("/cache/data", get(cache::data::<S>))
        .route("/cache/stats", get(cache::stats::<S>))
        .route("/health", get(health))
}

pub async fn health() -> &'static str {
    "OK"
}
