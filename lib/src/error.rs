//! Error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The error categories a request handler can return, each carrying the
/// human-readable message that goes into the JSON body's `error` field.
/// IP admission and token auth are rejected earlier, in the request
/// pipeline middleware, so their "Forbidden"/"Unauthorized" responses are
/// built directly there rather than through this type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad name, bad mode, malformed backup filename, non-JSON body where JSON is required.
    #[error("{0}")]
    Validation(String),
    /// Unknown entry, missing backup, missing target file, unknown route.
    #[error("{0}")]
    NotFound(String),
    /// PathGuard rejection or symlink target.
    #[error("{0}")]
    PathDenied(String),
    /// Write failure, uncreatable backup dir, subprocess launch error.
    #[error("{0}")]
    Transient(String),
    /// Unknown/forbidden action token, forbidden sub-command, bad argument syntax.
    #[error("{0}")]
    ActionPolicy(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PathDenied(_) => StatusCode::BAD_REQUEST,
            AppError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ActionPolicy(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "ok": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Convenience alias used throughout the handlers and components.
pub type AppResult<T> = Result<T, AppError>;
