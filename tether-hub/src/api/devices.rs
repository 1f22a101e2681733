use axum::{Json, extract::State};

use crate::state::AppState;
use crate::storage::HubStorage;

use super::models::ConnectedDevicesResponse;

/// `GET /devices/connected`
pub async fn connected_devices<S: HubStorage>(
    State(state): State<AppState<S>>,
) -> Json<ConnectedDevicesResponse> {
    let sessions = state.registry.sessions().await;
    let devices: Vec<String> = sessions.iter().map(|s| s.device_id.to_string()).collect();

    Json(ConnectedDevicesResponse {
        count: devices.len(),
        devices,
        sessions,
    })
}
