//! HTTP error type and mappings.
//!
//! Maps domain errors onto status codes and a JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mcpbridge_core::ProcessError;
use serde::Serialize;
use thiserror::Error;

/// HTTP-facing error type for all bridge handlers.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Invalid ingress payload (content type, JSON syntax, envelope shape).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Child not running, shutting down, or a stream at capacity.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            HttpError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<ProcessError> for HttpError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotRunning => {
                HttpError::ServiceUnavailable("child process is not running".to_owned())
            }
            ProcessError::SpawnFailed(msg) => HttpError::ServiceUnavailable(msg),
            ProcessError::ShuttingDown => {
                HttpError::ServiceUnavailable("bridge is shutting down".to_owned())
            }
            ProcessError::Io(e) => HttpError::Internal(format!("stdin write failed: {e}")),
        }
    }
}
