//! Lenient JSON body parsing.
//!
//! Some upstream clients have been observed to send a valid JSON document
//! followed by trailing garbage. Instead of nested catch-and-retry, parsing
//! runs an ordered list of recovery strategies, each returning
//! result-or-failure, and the first success wins.

use crate::core::error::{GatewayError, Result};
use serde_json::Value;

/// Parse a request body into a JSON value, tolerating a BOM and trailing
/// garbage after the first complete document.
///
/// Returns `BadRequest` with the strict-parse error when no strategy
/// succeeds.
pub fn parse_lenient(body: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(body)
        .map_err(|e| GatewayError::BadRequest(format!("Request body is not valid UTF-8: {}", e)))?;

    let trimmed = text.trim().trim_start_matches('\u{feff}');
    if trimmed.is_empty() {
        return Err(GatewayError::BadRequest("Request body is empty".to_string()));
    }

    let strategies: [fn(&str) -> std::result::Result<Value, serde_json::Error>; 2] =
        [parse_strict, parse_first_document];

    let mut first_error = None;
    for strategy in strategies {
        match strategy(trimmed) {
            Ok(value) => return Ok(value),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    let e = first_error.expect("at least one strategy ran");
    // Truncate on char boundaries; byte slicing can land mid-character.
    let preview: String = trimmed.chars().take(50).collect();
    tracing::error!(
        error = %e,
        body_len = body.len(),
        preview = %preview,
        "Failed to parse request body as JSON"
    );
    Err(GatewayError::BadRequest(format!("Invalid JSON body: {}", e)))
}

fn parse_strict(text: &str) -> std::result::Result<Value, serde_json::Error> {
    serde_json::from_str(text)
}

/// Parse the first complete JSON document and discard whatever follows it.
fn parse_first_document(text: &str) -> std::result::Result<Value, serde_json::Error> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => {
            let remainder = text.len() - stream.byte_offset();
            if remainder > 0 {
                tracing::warn!(
                    discarded_bytes = remainder,
                    "Recovered first JSON document, discarding trailing data"
                );
            }
            Ok(value)
        }
        Some(Err(e)) => Err(e),
        None => serde_json::from_str(text), // empty stream, surface the strict error
    }
}
