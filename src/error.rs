use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;

/// Failure talking to a sensor's report endpoint. Always scoped to one sensor.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("sensor answered with HTTP {0}")]
    Status(u16),
    #[error("sensor unreachable: {0}")]
    Unreachable(String),
    #[error("failed to read report body: {0}")]
    Body(String),
    #[error("sensor misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row is invalid: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db.code().as_deref() == Some("23505"),
            _ => false,
        }
    }
}

/// Run-level failures. Anything scoped to a single sensor, bucket or store is
/// folded into the run's report instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        tracing::error!(error = %err, "pipeline pass failed");
        match err {
            PipelineError::Config(message) => {
                Self::internal(format!("pipeline misconfigured: {message}"))
            }
            PipelineError::Store(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, "Store unavailable"),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        PipelineError::from(err).into()
    }
}

pub type AppResult<T> = Result<T, AppError>;
