//! Error types and Axum response conversions.

use crate::storage::StorageError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Why a code or credential was rejected.
///
/// Kept for logs only. Callers always see one undifferentiated
/// "invalid credential" failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    WrongCode,
    CodeExpired,
    CodeConsumed,
    NoCode,
    Malformed,
    BadSignature,
    TokenExpired,
    Revoked,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::WrongCode => "wrong_code",
            InvalidReason::CodeExpired => "code_expired",
            InvalidReason::CodeConsumed => "code_consumed",
            InvalidReason::NoCode => "no_code",
            InvalidReason::Malformed => "malformed",
            InvalidReason::BadSignature => "bad_signature",
            InvalidReason::TokenExpired => "token_expired",
            InvalidReason::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors of the challenge and credential lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid credential ({0})")]
    InvalidCredential(InvalidReason),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Signing error: {0}")]
    Signing(String),
}

/// Application error types.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited,
}

/// Message shown for every rejected code or token.
pub const INVALID_CREDENTIAL_MESSAGE: &str = "Invalid or expired credentials";

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation(msg) => AppError::BadRequest(msg),
            AuthError::SessionNotFound => {
                AppError::NotFound("Invalid or expired session".to_string())
            }
            AuthError::SessionExpired => AppError::Unauthorized(
                "Session expired. Please request a new OTP.".to_string(),
            ),
            AuthError::InvalidCredential(reason) => {
                tracing::debug!(reason = %reason, "Credential rejected");
                AppError::Unauthorized(INVALID_CREDENTIAL_MESSAGE.to_string())
            }
            AuthError::Storage(e) => AppError::Internal(e.to_string()),
            AuthError::Signing(msg) => AppError::Internal(format!("Signing error: {}", msg)),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Unreadable bodies get the same `{"error": ..}` shape as every other failure.
impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(status = %rejection.status(), "Request body rejected");
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Internal(msg) => {
                // Log detailed error server-side, return generic message to client
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many OTP requests, please try again later.".to_string(),
            ),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
