//! Maps [`kv_core::error::Error`] onto the HTTP status/body contract every
//! route shares: every non-fatal error carries
//! `{status, error, message, path, timestamp}`; internal/fatal errors
//! cross the boundary as an opaque 500 with no internal detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use kv_core::error::Error as CoreError;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    error: &'static str,
    message: String,
    path: String,
    timestamp: chrono::DateTime<Utc>,
}

/// Wraps a [`CoreError`] with the request path it occurred on so the
/// response body can carry it, per the error contract.
pub struct ApiError {
    pub source: CoreError,
    pub path: String,
}

impl ApiError {
    pub fn new(source: CoreError, path: impl Into<String>) -> Self {
        ApiError { source, path: path.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.source {
            CoreError::NotFound => (StatusCode::NOT_FOUND, self.source.to_string()),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, self.source.to_string()),
            CoreError::CasConflict => (StatusCode::CONFLICT, self.source.to_string()),
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, self.source.to_string()),
            CoreError::UnsatisfiableRange => {
                (StatusCode::RANGE_NOT_SATISFIABLE, self.source.to_string())
            }
            CoreError::Internal(_) | CoreError::Fatal(_) => {
                log::error!("internal error on {}: {}", self.path, self.source);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = ErrorBody {
            status: status.as_u16(),
            error: self.source.code(),
            message,
            path: self.path,
            timestamp: Utc::now(),
        };

        (status, Json(body)).into_response()
    }
}
