//! HTTP error taxonomy shared by every handler.
//!
//! Module-level errors (`StoreError`, `TokenError`, `SessionError`) are
//! recovered at the handler boundary and mapped into exactly one of these
//! variants; nothing propagates past a handler uncaught. Every response,
//! success or failure, is a JSON envelope whose top-level `status` field
//! mirrors the HTTP status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Fallback message for internal failures that carry no detail of their own.
pub const UNKNOWN_ERROR: &str = "Unknown error occurred";

/// The full error surface of the API, one variant per status code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input: bad JSON, bad id, out-of-range pagination (400).
    #[error("{0}")]
    Validation(String),
    /// Missing identity, or a token that fails verification (401).
    #[error("{0}")]
    Unauthorized(String),
    /// Verified identity without the rights for this resource (403).
    #[error("{0}")]
    Forbidden(String),
    /// Missing entity or missing collection (404).
    #[error("{0}")]
    NotFound(String),
    /// The path exists but not for this method (405).
    #[error("Method not allowed")]
    MethodNotAllowed,
    /// State conflict: duplicate email, already authenticated (409).
    #[error("{0}")]
    Conflict(String),
    /// Everything else (500). The message is surfaced verbatim.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError::Conflict(msg.into())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut message = self.to_string();
        if message.is_empty() {
            message = UNKNOWN_ERROR.to_string();
        }
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), %message, "request failed");
        }
        (
            status,
            Json(json!({ "status": status.as_u16(), "message": message })),
        )
            .into_response()
    }
}
