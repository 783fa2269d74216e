//! Typed error hierarchy for the core. Every component returns `ApiError`
//! (or wraps one) so the HTTP adapter is the only place a status code is
//! chosen — see spec.md §7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("access key expired")]
    Expired,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large")]
    TooLarge,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Expired => StatusCode::UNAUTHORIZED,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ConnectionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Sensitive values (access key tokens, JWTs) never end up in an
        // ApiError message — callers format errors before wrapping.
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Convert an infrastructure-level failure (DB, object store) that carries no
/// programmatic meaning into `ApiError::Internal`. Typed failures (NotFound,
/// Conflict, ...) should be constructed directly instead of routed through
/// this conversion.
impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("row not found".into()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                ApiError::Conflict(db_err.to_string())
            }
            other => ApiError::ConnectionFailed(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
