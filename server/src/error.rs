//! Error types for the OpsDeck server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the OpsDeck server
#[derive(Debug, Error)]
pub enum Error {
    // Process errors (4000-4099)
    #[error("Process not found")]
    ProcessNotFound(String),

    #[error("Process already exited: {0}")]
    ProcessAlreadyExited(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    // Terminal errors (4100-4199)
    #[error("Terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("max sessions reached ({0})")]
    MaxSessionsReached(usize),

    #[error("Failed to allocate pseudo-terminal: {0}")]
    PtyAllocationFailed(String),

    // General errors (1000-1999)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Process errors (4000-4099)
            Error::ProcessNotFound(_) => 4001,
            Error::ProcessAlreadyExited(_) => 4002,
            Error::SpawnFailed(_) => 4003,
            Error::KillFailed(_) => 4004,

            // Terminal errors (4100-4199)
            Error::SessionNotFound(_) => 4101,
            Error::MaxSessionsReached(_) => 4102,
            Error::PtyAllocationFailed(_) => 4103,

            // General errors (1000-1999)
            Error::InvalidMessage(_) => 1001,
            Error::InvalidParameter(_) => 1002,
            Error::Internal(_) => 1003,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ProcessNotFound(_) | Error::SessionNotFound(_) => StatusCode::NOT_FOUND,

            Error::ProcessAlreadyExited(_) => StatusCode::CONFLICT,

            Error::InvalidMessage(_) | Error::InvalidParameter(_) => StatusCode::BAD_REQUEST,

            Error::MaxSessionsReached(_) => StatusCode::TOO_MANY_REQUESTS,

            Error::SpawnFailed(_)
            | Error::KillFailed(_)
            | Error::PtyAllocationFailed(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u32,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}
