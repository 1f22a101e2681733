use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

use crate::commands::{AckRequest, EnqueueRequest};
use crate::state::AppState;
use crate::storage::HubStorage;

use super::error::ApiError;
use super::models::{
    AckResponse, ChangeWifiRequest, PollQuery, PollResponse, PolledCommand, SubmissionResponse,
};

/// `POST /commands`
pub async fn submit_command<S: HubStorage>(
    State(state): State<AppState<S>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    let submission = state.commands.submit(request).await?;
    Ok((StatusCode::CREATED, Json(submission.into())))
}

/// `GET /commands/poll?device_id=&limit=`
///
/// Returned commands are marked `sent`.
pub async fn poll_commands<S: HubStorage>(
    State(state): State<AppState<S>>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let limit = query.limit();
    let device_id = query.device_id.unwrap_or_default();
    let commands = state.commands.take_pending(&device_id, limit).await?;

    let commands: Vec<PolledCommand> = commands.into_iter().map(PolledCommand::from).collect();
    Ok(Json(PollResponse {
        count: commands.len(),
        commands,
    }))
}

/// `POST /command-responses`
pub async fn acknowledge<S: HubStorage>(
    State(state): State<AppState<S>>,
    Json(request): Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let command = state.commands.ack(request).await?;
    Ok(Json(AckResponse {
        status: "ok",
        command: command.into(),
    }))
}

/// `POST /devices/{id}/change-wifi`
pub async fn change_wifi<S: HubStorage>(
    State(state): State<AppState<S>>,
    Path(device_id): Path<String>,
    Json(request): Json<ChangeWifiRequest>,
) -> Result<(StatusCode, Json<SubmissionResponse>), ApiError> {
    let submission = state
        .commands
        .change_wifi(&device_id, &request.ssid, &request.password)
        .await?;
    Ok((StatusCode::CREATED, Json(submission.into())))
}
