//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use spawnwatch_tracker::TrackerError;

/// Errors returned by route handlers.
#[derive(Debug, Error)]
pub enum WebError {
    /// Tracker error.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl WebError {
    fn status(&self) -> StatusCode {
        match self {
            WebError::BadRequest(_) | WebError::Tracker(TrackerError::InvalidInput(_)) => {
                StatusCode::BAD_REQUEST
            }
            WebError::Tracker(TrackerError::NotFound(_)) => StatusCode::NOT_FOUND,
            WebError::Tracker(TrackerError::AlreadyExists(_)) => StatusCode::CONFLICT,
            WebError::Tracker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
