//! HTTP error taxonomy.
//!
//! Handlers return `ApiResult<T>`; every error kind maps to one canonical
//! status code and the envelope `{error, message?, details?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::kernel::validator::FieldError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid recipe")]
    InvalidRecipe(Vec<FieldError>),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, envelope) = match self {
            ApiError::InvalidRecipe(details) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope {
                    error: "invalid_recipe",
                    message: None,
                    details: Some(details),
                },
            ),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ErrorEnvelope {
                    error: "not_found",
                    message: Some(format!("{what} not found")),
                    details: None,
                },
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorEnvelope {
                    error: "unauthorized",
                    message: None,
                    details: None,
                },
            ),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                ErrorEnvelope {
                    error: "conflict",
                    message: Some(message),
                    details: None,
                },
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorEnvelope {
                    error: "bad_request",
                    message: Some(message),
                    details: None,
                },
            ),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorEnvelope {
                        error: "internal",
                        message: Some("internal server error".to_string()),
                        details: None,
                    },
                )
            }
        };

        (status, Json(envelope)).into_response()
    }
}
