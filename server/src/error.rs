use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

use crate::validation::FieldErrors;

/// Every failure a handler can surface
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed or missing input, reported per field
    #[error("Validation failed")]
    Validation(FieldErrors),

    /// Request could not be parsed at all
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing, malformed, expired or revoked bearer token
    #[error("Unauthenticated")]
    Authentication,

    /// Login failure. Never says which half of the credentials was wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many requests")]
    TooManyRequests,

    /// Filesystem write/read/delete failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// An external analysis service failed or answered garbage
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// An external analysis service is not configured
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<FieldErrors>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication | ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Storage(_) | ApiError::Database(_) | ApiError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, errors) = match self {
            ApiError::Validation(errors) => (
                errors
                    .first_message()
                    .unwrap_or("The given data was invalid.")
                    .to_string(),
                Some(errors),
            ),
            ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Unavailable(msg) => (msg, None),
            ApiError::Authentication => ("Unauthenticated.".to_string(), None),
            ApiError::InvalidCredentials => ("Invalid credentials".to_string(), None),
            ApiError::TooManyRequests => (
                "Too many attempts. Please try again later.".to_string(),
                None,
            ),
            // Don't leak details; log them instead
            ApiError::Storage(detail) => {
                tracing::error!("Storage failure: {detail}");
                ("Storage operation failed".to_string(), None)
            }
            ApiError::Upstream(detail) => {
                tracing::error!("Analysis service failure: {detail}");
                ("Analysis service failed".to_string(), None)
            }
            ApiError::Database(e) => {
                tracing::error!("Database failure: {e}");
                ("Internal server error".to_string(), None)
            }
            ApiError::Unexpected(detail) => {
                tracing::error!("Unexpected failure: {detail}");
                ("Internal server error".to_string(), None)
            }
        };

        let body = Json(ErrorBody {
            success: false,
            message,
            errors,
        });

        (status, body).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Storage(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(_: jsonwebtoken::errors::Error) -> Self {
        ApiError::Authentication
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(format!("Multipart error: {}", e.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}
