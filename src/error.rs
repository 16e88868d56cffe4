use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt::Display;
use std::time::Duration;

/// Failure taxonomy for the processing pipeline. Engine code produces these
/// without recovering; workers decide retry vs quarantine, route handlers map
/// them onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("upstream call timed out")]
    Timeout,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Whether the scheduler should re-attempt the task. Cancellation is
    /// handled separately: it re-enqueues without consuming an attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout | PipelineError::Transient(_) | PipelineError::RateLimited { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Timeout => "timeout",
            PipelineError::Transient(_) => "transient",
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::Permanent(_) => "permanent",
            PipelineError::InsufficientData(_) => "insufficient_data",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Fatal(_) => "fatal",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            PipelineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Transient(_) => StatusCode::BAD_GATEWAY,
            PipelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::InsufficientData(_) => StatusCode::NOT_FOUND,
            PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                return PipelineError::Conflict("duplicate row".to_string());
            }
        }
        PipelineError::Transient(err.to_string())
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub path: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            path: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        Self::new(err.http_status(), err.code(), err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                path: self.path,
                details: None,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn internal_error(err: impl Display) -> AppError {
    tracing::error!(error = %err, "internal error");
    AppError::internal("Internal server error")
}

pub fn map_db_error(err: sqlx::Error) -> AppError {
    let (status, code, message) = match &err {
        sqlx::Error::RowNotFound => (StatusCode::NOT_FOUND, "not_found", "Resource not found"),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => (StatusCode::CONFLICT, "conflict", "Resource already exists"),
            Some("23503") | Some("23502") | Some("22P02") => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation", "Invalid request")
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Database error",
            ),
        },
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Database error",
        ),
    };
    tracing::error!(error = %err, status = %status, "database error");
    AppError::new(status, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(PipelineError::Timeout.is_retryable());
        assert!(PipelineError::Transient("boom".into()).is_retryable());
        assert!(PipelineError::RateLimited { retry_after: None }.is_retryable());
        assert!(!PipelineError::Permanent("schema".into()).is_retryable());
        assert!(!PipelineError::InsufficientData("empty".into()).is_retryable());
        assert!(!PipelineError::Conflict("dup".into()).is_retryable());
        assert!(!PipelineError::Fatal("oob".into()).is_retryable());
    }

    #[test]
    fn http_mapping_matches_contract() {
        assert_eq!(
            PipelineError::Transient("x".into()).http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            PipelineError::RateLimited { retry_after: None }.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            PipelineError::Permanent("x".into()).http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PipelineError::InsufficientData("x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PipelineError::Conflict("x".into()).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PipelineError::Fatal("x".into()).http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
