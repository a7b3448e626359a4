// Error taxonomy shared across the service.
//
// Handlers translate these to HTTP statuses; response bodies carry only the
// public message, never internals or backtraces.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad input: unsupported media type, unknown model, bad export format.
    #[error("{0}")]
    Validation(String),

    /// Missing call / session / transcript.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate download or lock contention.
    #[error("{0}")]
    Conflict(String),

    /// Transcription server down or still warming up.
    #[error("{0}")]
    Unavailable(String),

    /// Retryable operation that exhausted its retry budget.
    #[error("{0}")]
    Transient(String),

    /// Unexpected internal failure.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Transient(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {self}");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve the taxonomy when a typed error bubbled through anyhow.
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("record not found".to_string()),
            other => AppError::Internal(format!("database error: {other}")),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("io error: {err}"))
    }
}
