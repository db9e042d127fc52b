//! Centralized error type for Kindred services.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! variants that convert directly into relay API responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error returned by the relay's HTTP routes.
#[derive(Debug, thiserror::Error)]
pub enum KindredError {
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl KindredError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
        }
    }
}

impl IntoResponse for KindredError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using KindredError.
pub type KindredResult<T> = Result<T, KindredError>;
