//! Error taxonomy for the gateway.
//!
//! `AppError` covers both the admin-API-facing errors and the request-path
//! error kinds from the pipeline orchestrator. Request-path variants are
//! normally caught and turned into failover decisions before they ever reach
//! an HTTP response; they only surface here when every candidate account is
//! exhausted.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Fatal at startup; caller maps this to exit code 1.
    #[error("configuration error: {0}")]
    Config(String),

    /// Account-level, non-retryable for that account.
    #[error("auth error: {0}")]
    Auth(String),

    /// Retryable by failover to the next candidate.
    #[error("transient auth error: {0}")]
    TransientAuth(String),

    /// Retryable by failover to the next candidate.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Internal marker raised by the response classifier.
    #[error("rate limited")]
    RateLimit,

    /// Cooperative cancellation; never rendered to the client.
    #[error("client disconnected")]
    ClientDisconnect,

    /// No accounts remained and the final attempt failed outright (no
    /// upstream response was ever produced to forward verbatim).
    #[error("upstream unavailable: {0}")]
    Provider(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Out-of-scope admin endpoint stubbed per spec.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// The store's read/write methods return `anyhow::Result` (see
/// `crate::store`), so any of them can be `?`-propagated straight into a
/// handler's `AppResult`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<sqlx::Error>() {
            Ok(sqlx_err) => AppError::Database(sqlx_err),
            Err(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Config(msg) => {
                error!("configuration error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", msg.clone())
            }
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, "AUTH_ERROR", msg.clone()),
            AppError::TransientAuth(msg) => {
                (StatusCode::BAD_GATEWAY, "TRANSIENT_AUTH_ERROR", msg.clone())
            }
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone()),
            AppError::RateLimit => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_ERROR",
                "rate limited".to_string(),
            ),
            AppError::ClientDisconnect => (
                StatusCode::BAD_GATEWAY,
                "CLIENT_DISCONNECT",
                "client disconnected".to_string(),
            ),
            AppError::Provider(msg) => {
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error": { "type": "upstream_unavailable", "message": msg }
                    })),
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::NotImplemented(msg) => {
                (StatusCode::NOT_IMPLEMENTED, "NOT_IMPLEMENTED", msg.clone())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Database(err) => {
                error!("database error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(msg) => {
                error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = Json(json!({
            "success": false,
            "error": { "code": code, "message": message },
        }));

        (status, body).into_response()
    }
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr) => {
        $crate::error::AppError::Validation($msg.to_string())
    };
}

#[macro_export]
macro_rules! not_found_error {
    ($msg:expr) => {
        $crate::error::AppError::NotFound($msg.to_string())
    };
}
