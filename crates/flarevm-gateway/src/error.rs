//! API error types and responses.
//!
//! This module defines the standard error format for all API responses:
//! `{"error": {"code": "...", "message": "..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use flarevm_auth::AuthError;
use flarevm_control::ControlError;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid authentication token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller may not perform this request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A control plane operation failed.
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

/// Error details.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Control(e) => StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Get the error code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::Control(e) => e.code(),
        }
    }

    /// The message shown to clients. Storage and internal details stay in
    /// the logs.
    fn public_message(&self) -> String {
        match self {
            Self::Control(ControlError::Store(e)) => {
                tracing::error!(error = %e, "Store error");
                "storage error".to_string()
            }
            Self::Control(ControlError::Internal(msg)) => {
                tracing::error!(error = %msg, "Internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.public_message();

        let body = ErrorResponse {
            error: ErrorBody { code, message },
        };

        (status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken
            | AuthError::TokenExpired
            | AuthError::InvalidSignature
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::InvalidUserId
            | AuthError::InvalidToken(_) => Self::Unauthorized(err.to_string()),
            AuthError::InvalidRole(_) => Self::Forbidden(err.to_string()),
            AuthError::Internal(_) => {
                tracing::error!(error = %err, "Auth internal error");
                Self::Control(ControlError::Internal("authentication service error".to_string()))
            }
        }
    }
}
