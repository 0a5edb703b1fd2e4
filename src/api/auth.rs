//! Caller authentication.
//!
//! Callers present one of the keys from the caller-key file. The OpenAI
//! surface takes `Authorization: Bearer`; the Anthropic surface additionally
//! accepts `x-api-key`. A bare key in the Authorization header (no `Bearer `
//! prefix) is tolerated.

use axum::http::HeaderMap;

use crate::api::handlers::GatewayState;
use crate::core::error::{GatewayError, Result};

/// Authentication header format to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFormat {
    /// Only the Authorization: Bearer header (OpenAI style)
    BearerOnly,
    /// Both x-api-key and Authorization: Bearer headers
    MultiFormat,
}

fn extract_api_key(headers: &HeaderMap, format: AuthFormat) -> Option<&str> {
    match format {
        AuthFormat::BearerOnly => extract_bearer(headers),
        AuthFormat::MultiFormat => {
            // x-api-key takes priority
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .or_else(|| extract_bearer(headers))
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s))
}

/// Validate the caller's key against the configured key set.
pub fn authenticate(state: &GatewayState, headers: &HeaderMap, format: AuthFormat) -> Result<()> {
    let key = extract_api_key(headers, format).ok_or(GatewayError::Unauthorized)?;
    if state.caller_keys.contains(key) {
        Ok(())
    } else {
        tracing::warn!("Rejected request with invalid API key");
        Err(GatewayError::Unauthorized)
    }
}
