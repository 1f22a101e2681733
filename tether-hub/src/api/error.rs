use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::buffer::FlushError;
use crate::commands::CommandError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(String),
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::InvalidRequest(_) => ApiError::BadRequest(err.to_string()),
            CommandError::UnknownCommand(_) => ApiError::NotFound(err.to_string()),
            CommandError::DeviceMismatch { .. } | CommandError::AlreadyFinal { .. } => {
                ApiError::Conflict(err.to_string())
            }
            CommandError::Storage(_) => {
                tracing::error!(error = %err, "command storage failure");
                ApiError::InternalServerError("storage failure".to_string())
            }
        }
    }
}

impl From<FlushError> for ApiError {
    fn from(err: FlushError) -> Self {
        ApiError::InternalServerError(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = ErrorResponse {
            success: false,
            message,
        };

        (status, Json(body)).into_response()
    }
}
