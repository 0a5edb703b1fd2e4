//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`GatewayError`] that wraps the
//! various error sources and implements proper HTTP response conversion.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for
/// consistent handling.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller authentication failures
    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Requested model is not in the alias map
    #[error("Model {0} not found")]
    ModelNotFound(String),

    /// The account file yielded no usable tokens at startup
    #[error("Token pool is empty: no usable access tokens were loaded")]
    EmptyTokenPool,

    /// Every token in the pool is currently rate-limited
    #[error("No available token: all upstream tokens are rate-limited")]
    NoAvailableToken,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else if let Some(status) = e.status() {
                    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::EmptyTokenPool | GatewayError::NoAvailableToken => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "authentication_error",
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::ModelNotFound(_) => "not_found_error",
            GatewayError::EmptyTokenPool | GatewayError::NoAvailableToken => "overloaded_error",
            _ => "api_error",
        }
    }

    /// Error body in the Anthropic envelope, for the `/v1/messages` surface.
    pub fn to_anthropic_response(&self) -> Response {
        let body = Json(json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": null,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;
