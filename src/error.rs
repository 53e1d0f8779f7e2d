//! Top-level error type and its HTTP boundary mapping.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;
use crate::lock::LockError;

/// Errors that can surface at the HTTP boundary or a scheduler task
/// boundary. Each variant maps to exactly one of the policies in the
/// error-handling design: 400, 429, or 500, or (outside this type) a
/// silent non-error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing required query parameter: {0}")]
    MissingParam(&'static str),

    #[error("too many digests requested")]
    TooManyDigests,

    #[error("download-serve slot unavailable")]
    Busy,

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::MissingParam(_) | AppError::TooManyDigests => StatusCode::BAD_REQUEST,
            AppError::Busy => StatusCode::TOO_MANY_REQUESTS,
            AppError::Engine(_) | AppError::Lock(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
