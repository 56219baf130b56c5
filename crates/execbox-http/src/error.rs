//! Error types for the HTTP API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use execbox_core::ExecError;
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Error reported by the execution service
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request body or path
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Exec(e) => match e {
                ExecError::Validation(_) | ExecError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
                ExecError::NotFound(_) => StatusCode::NOT_FOUND,
                ExecError::NotReady { .. } | ExecError::NotCancellable { .. } => StatusCode::CONFLICT,
                ExecError::WaitTimeout { .. } => StatusCode::ACCEPTED,
                ExecError::InvalidTransition { .. }
                | ExecError::Config(_)
                | ExecError::Io(_)
                | ExecError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Json(_) | ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Exec(e) => match e {
                ExecError::Validation(_) => "validation_error",
                ExecError::UnsupportedLanguage(_) => "unsupported_language",
                ExecError::NotFound(_) => "not_found",
                ExecError::NotReady { .. } => "not_ready",
                ExecError::WaitTimeout { .. } => "wait_timeout",
                ExecError::NotCancellable { .. } => "not_cancellable",
                ExecError::InvalidTransition { .. } => "invalid_transition",
                ExecError::Config(_) => "config_error",
                ExecError::Io(_) => "io_error",
                ExecError::Internal(_) => "internal_error",
            },
            ServerError::Json(_) => "json_error",
            ServerError::Io(_) => "io_error",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::PayloadTooLarge(_) => "payload_too_large",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    fn summary(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "Invalid request",
            StatusCode::NOT_FOUND => "Job not found",
            StatusCode::CONFLICT => "Request conflicts with the job's state",
            StatusCode::PAYLOAD_TOO_LARGE => "Request body too large",
            StatusCode::ACCEPTED => "Job still running",
            _ => "Internal server error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::debug!("Request rejected ({}): {}", status, self);
        }
        let body = Json(json!({
            "error": self.summary(),
            "error_type": self.error_type(),
            "details": self.to_string(),
            "timestamp": chrono::Utc::now()
        }));
        (status, body).into_response()
    }
}
