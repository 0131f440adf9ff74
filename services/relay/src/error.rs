use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use types::errors::{IdError, MessageError};

use crate::crypto::Rejection;
use crate::locks::LockStoreError;

/// Central error type for the relay's HTTP surface
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] LockStoreError),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl From<MessageError> for AppError {
    fn from(err: MessageError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<IdError> for AppError {
    fn from(err: IdError) -> Self {
        AppError::BadRequest(format!("invalid id: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::Rejected(rejection) if rejection.is_authentication() => {
                (StatusCode::UNAUTHORIZED, rejection.to_string(), "UNAUTHORIZED")
            }
            AppError::Rejected(rejection) => {
                (StatusCode::BAD_REQUEST, rejection.to_string(), "REJECTED")
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            AppError::Storage(err) => {
                tracing::error!(error = %err, "Lock storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Lock storage failure".to_string(),
                    "STORAGE_ERROR",
                )
            }
            AppError::InternalError(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}
