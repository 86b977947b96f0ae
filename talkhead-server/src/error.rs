use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use talkhead_core::GenerateError;
use tracing::{error, warn};

/// An HTTP error carrying a human-readable message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<GenerateError> for ApiError {
    fn from(err: GenerateError) -> Self {
        let status = match &err {
            GenerateError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GenerateError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GenerateError::InferenceFailed { .. }
            | GenerateError::Spawn { .. }
            | GenerateError::Io { .. }
            | GenerateError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        } else {
            warn!(status = %self.status, "{}", self.message);
        }
        let body = Json(json!({ "ok": false, "error": self.message }));
        (self.status, body).into_response()
    }
}
