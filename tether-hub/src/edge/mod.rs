pub mod ws;

use tether_core::DeviceId;
use tether_core::protocol::{self, CommandResponse, Inbound, SensorData};
use tracing::{debug, warn};

use crate::commands::AckRequest;
use crate::state::AppState;
use crate::storage::HubStorage;

/// Apply one text message received on a device's live connection.
///
/// Nothing here closes the connection: bad input is logged and dropped.
pub async fn handle_message<S: HubStorage>(state: &AppState<S>, device_id: &DeviceId, text: &str) {
    state.registry.touch(device_id).await;

    let message = match protocol::decode_inbound(text) {
        Ok(message) => message,
        Err(e) if e.is_unknown_type() => {
            warn!(error = %e, "ignoring message of unknown type");
            return;
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed message");
            return;
        }
    };

    match message {
        Inbound::SensorData(data) => ingest_reading(state, device_id, data),
        Inbound::Heartbeat(_) => debug!("heartbeat"),
        Inbound::CommandResponse(response) => acknowledge(state, device_id, response).await,
    }
}

fn ingest_reading<S: HubStorage>(state: &AppState<S>, device_id: &DeviceId, data: SensorData) {
    if let Some(claimed) = data.device_id.as_deref().map(str::trim)
        && !claimed.is_empty()
        && claimed != device_id.as_str()
    {
        warn!(claimed, "dropping reading posted for another device");
        return;
    }

    state.buffer.add_data_point(data.into_reading(device_id.clone()));
}

async fn acknowledge<S: HubStorage>(
    state: &AppState<S>,
    device_id: &DeviceId,
    response: CommandResponse,
) {
    let request = AckRequest {
        command_id: response.command_id,
        status: Some(response.status),
        message: response.message,
        device_id: Some(device_id.to_string()),
    };
    let command_id = request.command_id.clone();

    match state.commands.ack(request).await {
        Ok(command) => debug!(%command_id, status = %command.status, "command response recorded"),
        Err(e) => warn!(%command_id, error = %e, "command response rejected"),
    }
}
