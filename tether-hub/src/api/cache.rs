use std::collections::BTreeMap;

use axum::{Json, extract::State};
use tether_core::DeviceId;

use crate::buffer::BufferedReading;
use crate::state::AppState;
use crate::storage::HubStorage;

use super::error::ApiError;
use super::models::{FlushResponse, StatsResponse};

/// `POST /cache/process`: flush now.
pub async fn process<S: HubStorage>(
    State(state): State<AppState<S>>,
) -> Result<Json<FlushResponse>, ApiError> {
    let report = state.buffer.flush().await?;
    Ok(Json(FlushResponse {
        success: true,
        report,
    }))
}

/// `GET /cache/data`
pub async fn data<S: HubStorage>(
    State(state): State<AppState<S>>,
) -> Json<BTreeMap<DeviceId, Vec<BufferedReading>>> {
    Json(state.buffer.snapshot())
}

/// `GET /cache/stats`
pub async fn stats<S: HubStorage>(State(state): State<AppState<S>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.buffer.stats(),
        connected_devices: state.registry.list().await.len(),
        uptime_secs: state.uptime_secs(),
    })
}
