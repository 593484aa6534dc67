use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use kiln_core::{GenerationError, JobError, QueueFull};
use serde::Serialize;

/// OpenAI-style error body: `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("model is still loading")]
    NotReady,

    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("timed out waiting for the image")]
    Timeout,

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("{0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Generation(err) => ApiError::Generation(err),
            JobError::Abandoned => ApiError::ShuttingDown,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ApiError::BadRequest(_) | ApiError::Generation(GenerationError::InvalidParams(_)) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
            ),
            ApiError::NotReady => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", "model_loading")
            }
            ApiError::QueueFull(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", "server_busy")
            }
            ApiError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", "shutting_down")
            }
            ApiError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "server_error", "timeout"),
            ApiError::Generation(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "generation_failed")
            }
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, r#type, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), code, error = %self, "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), code, error = %self, "bad request");
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type,
                code,
            },
        };
        (status, Json(body)).into_response()
    }
}
