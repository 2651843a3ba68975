use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Offline: {0}")]
    Offline(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Offline(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Storage(e) => {
                error!("storage error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage error occurred".to_string(),
                )
            }
            AppError::Corrupt(e) => {
                error!("corrupt local record: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Corrupt local record".to_string(),
                )
            }
            AppError::Remote(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        };

        let body = Json(ErrorResponse {
            error: status.to_string(),
            message: error_message,
        });

        (status, body).into_response()
    }
}
