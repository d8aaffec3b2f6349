use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the detection pipeline.
///
/// Batch processing captures these per resolution and returns them as data;
/// single-image endpoints convert the first fatal one into a response.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to decode image: {0}")]
    DecodeFailure(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Upload of {actual_mb:.2}MB exceeds the {limit_mb:.2}MB limit")]
    SizeLimitExceeded { actual_mb: f64, limit_mb: f64 },

    #[error("Unknown resolution: {0}")]
    UnknownResolution(String),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Detection engine unavailable")]
    EngineUnavailable,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl DetectionError {
    /// HTTP status for this error on single-item endpoints
    pub fn status_code(&self) -> StatusCode {
        match self {
            DetectionError::DecodeFailure(_)
            | DetectionError::MissingInput(_)
            | DetectionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DetectionError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DetectionError::UnknownResolution(_) | DetectionError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DetectionError::Persistence(_)
            | DetectionError::Inference(_)
            | DetectionError::EngineUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            DetectionError::DecodeFailure(_) => "DECODE_FAILURE",
            DetectionError::MissingInput(_) => "MISSING_INPUT",
            DetectionError::SizeLimitExceeded { .. } => "SIZE_LIMIT_EXCEEDED",
            DetectionError::UnknownResolution(_) => "UNKNOWN_RESOLUTION",
            DetectionError::Persistence(_) => "PERSISTENCE_ERROR",
            DetectionError::Inference(_) => "INFERENCE_ERROR",
            DetectionError::EngineUnavailable => "ENGINE_UNAVAILABLE",
            DetectionError::InvalidRequest(_) => "INVALID_REQUEST",
            DetectionError::NotFound(_) => "NOT_FOUND",
        }
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}
