use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy surfaced by every handler and core operation. Kinds are
/// distinguished on purpose: a missing resource is never reported as a
/// permission failure and vice versa.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or invalid session")]
    Unauthorized,

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("Internal error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(ref source) => {
                log::error!("internal error: {}", source);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::Internal(Box::new(error))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Internal(Box::new(error))
    }
}

/// Maps a unique-constraint violation to `Conflict` with a stable message;
/// anything else stays an internal error.
pub fn unique_conflict(error: sqlx::Error, message: &'static str) -> ApiError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => ApiError::Conflict(message),
        _ => error.into(),
    }
}
