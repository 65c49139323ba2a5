//! Error taxonomy shared by every component.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("deadline of {0:?} exceeded")]
    Timeout(std::time::Duration),

    #[error("build failed: {stderr}")]
    CompileFailure { stderr: String },

    #[error("process exited with code {exit_code}")]
    ExecutionFailure { exit_code: i32 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("provisioning already running for user {0}")]
    AlreadyRunning(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::CompileFailure { .. } | Error::ExecutionFailure { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::AlreadyRunning(_) => StatusCode::CONFLICT,
            Error::InvalidPath(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
