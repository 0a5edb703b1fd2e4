//! Upstream HTTP client and request headers.
//!
//! The upstream endpoint only serves its own IDE client, so every request
//! carries the full header fingerprint that client sends, including fresh
//! per-request conversation identifiers.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use uuid::Uuid;

use crate::core::{GatewayConfig, GatewayError, Result};

/// Build the header set for one upstream request. The four conversation
/// identifiers are new UUIDs on every call.
pub fn codebuddy_headers(auth_token: &str) -> Result<HeaderMap> {
    let static_headers: &[(&str, &str)] = &[
        ("Accept", "application/json"),
        ("X-Stainless-Arch", "arm64"),
        ("X-Stainless-Lang", "js"),
        ("X-Stainless-Os", "MacOS"),
        ("X-Stainless-Package-Version", "4.96.0"),
        ("X-Stainless-Runtime", "node"),
        ("X-Stainless-Runtime-Version", "v22.12.0"),
        ("X-Stainless-Retry-Count", "0"),
        ("X-Stainless-Timeout", "600"),
        ("X-Agent-Intent", "craft"),
        ("X-IDE-Type", "CodeBuddyIDE"),
        ("X-IDE-Name", "CodeBuddyIDE"),
        ("X-IDE-Version", "0.2.2"),
        ("X-Domain", "www.codebuddy.ai"),
        ("User-Agent", "CodeBuddyIDE/0.2.2"),
        ("Host", "www.codebuddy.ai"),
        ("Accept-Encoding", "gzip, deflate, br"),
        ("Content-Type", "application/json"),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in static_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("Invalid header name: {e}")))?;
        headers.insert(name, HeaderValue::from_static(value));
    }

    headers.insert(
        HeaderName::from_static("x-conversation-id"),
        header_value(&format!("c-{}", Uuid::new_v4()))?,
    );
    headers.insert(
        HeaderName::from_static("x-conversation-request-id"),
        header_value(&format!("r-{}", Uuid::new_v4()))?,
    );
    headers.insert(
        HeaderName::from_static("x-conversation-message-id"),
        header_value(&format!("m-{}", Uuid::new_v4()))?,
    );
    headers.insert(
        HeaderName::from_static("x-request-id"),
        header_value(&format!("rn-{}", Uuid::new_v4()))?,
    );
    headers.insert(
        HeaderName::from_static("authorization"),
        header_value(&format!("Bearer {auth_token}"))?,
    );

    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Internal(format!("Invalid header value: {e}")))
}

/// Shared connection-pooled client for all upstream traffic.
pub fn build_http_client(config: &GatewayConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .danger_accept_invalid_certs(!config.verify_ssl)
        .build()?;
    Ok(client)
}
