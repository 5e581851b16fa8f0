// API error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Admin role required")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Energy depleted, next attempt in {}s", secs(.wait_ms))]
    EnergyDepleted { wait_ms: i64 },

    #[error("Too many attempts, retry in {}s", secs(.wait_ms))]
    RateLimited { wait_ms: i64 },

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Whole seconds to wait, rounded up so the client never retries early.
pub fn wait_seconds(wait_ms: i64) -> i64 {
    (wait_ms.max(0) + 999) / 1000
}

fn secs(wait_ms: &i64) -> i64 {
    wait_seconds(*wait_ms)
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::EnergyDepleted { .. } | ApiError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code sent as the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::EnergyDepleted { .. } => "energy_depleted",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Conflict(_) => "conflict",
            ApiError::Database(_) | ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::EnergyDepleted { wait_ms } | ApiError::RateLimited { wait_ms } => json!({
                "error": self.code(),
                "message": self.to_string(),
                "waitMs": wait_ms,
                "waitSeconds": wait_seconds(*wait_ms),
            }),
            ApiError::Database(e) => {
                tracing::error!("Database error: {e}");
                json!({ "error": self.code(), "message": "Internal server error" })
            }
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                json!({ "error": self.code(), "message": "Internal server error" })
            }
            _ => json!({ "error": self.code(), "message": self.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}
