//! Upstream stream handling.
//!
//! Every upstream call is made with `stream: true`; this module either
//! relays the event stream to the caller or folds it into a complete
//! completion object. Non-200 upstream bodies are sniffed for the
//! rate-limit marker before being relayed, so the failing token is benched
//! as a side effect of the response that revealed the limit.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use futures::stream::StreamExt;
use std::sync::Arc;

use crate::api::models::{
    ChatCompletionResponse, Choice, FunctionCall, ResponseMessage, StreamChunk, ToolCall, Usage,
};
use crate::core::{GatewayError, Result};
use crate::services::{TokenPool, RATE_LIMIT_MARKER};
use crate::transformer::openai_sse_chunks;

/// Check an upstream error body for the rate-limit marker and bench the
/// token that produced it.
pub async fn mark_if_rate_limited(pool: &TokenPool, auth_token: &str, body: &str) {
    if body.contains(RATE_LIMIT_MARKER) {
        tracing::warn!(body = %body, "Upstream reported frequency limit, benching token");
        pool.mark_rate_limited(auth_token, body).await;
    }
}

/// Build a `text/event-stream` response from pre-formatted events.
pub fn sse_response(events: Vec<String>) -> Response {
    let body = Body::from_stream(futures::stream::iter(
        events.into_iter().map(Ok::<String, std::io::Error>),
    ));
    sse_builder().body(body).unwrap()
}

fn sse_builder() -> axum::http::response::Builder {
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
}

/// Relay an upstream event stream to the caller byte for byte.
///
/// A non-200 status is turned into a single SSE error event after the
/// rate-limit sniff. A 200 response that is not an event stream (the
/// upstream occasionally answers a stream request with a plain completion)
/// is re-emitted as a synthetic chunk sequence.
pub async fn relay_upstream_stream(
    response: reqwest::Response,
    pool: Arc<TokenPool>,
    auth_token: String,
) -> Result<Response> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await?;
        mark_if_rate_limited(&pool, &auth_token, &body).await;
        let event = format!(
            "data: {}\n\n",
            serde_json::json!({"error": body})
        );
        return Ok(sse_response(vec![event]));
    }

    let is_event_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if !is_event_stream {
        let body: serde_json::Value = response.json().await?;
        return Ok(sse_response(openai_sse_chunks(&body)));
    }

    let byte_stream = response.bytes_stream().filter_map(|chunk_result| async {
        match chunk_result {
            Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
            Err(e) => {
                tracing::error!(error = %e, "Upstream stream error");
                None
            }
        }
    });

    Ok(sse_builder().body(Body::from_stream(byte_stream)).unwrap())
}

/// Fold a complete upstream event stream into one OpenAI-style completion.
///
/// On a non-200 status the upstream body is relayed unchanged with its
/// original status code after the rate-limit sniff.
pub async fn collect_buffered_response(
    mut response: reqwest::Response,
    requested_model: &str,
    pool: &TokenPool,
    auth_token: &str,
) -> Result<UpstreamOutcome> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let body = response.text().await?;
        mark_if_rate_limited(pool, auth_token, &body).await;
        return Ok(UpstreamOutcome::Error {
            status: StatusCode::from_u16(status.as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        });
    }

    let mut accumulator = StreamAccumulator::default();
    while let Some(chunk) = response.chunk().await? {
        accumulator.feed_bytes(&chunk);
    }

    Ok(UpstreamOutcome::Completion(accumulator.finish(requested_model)))
}

/// Result of a buffered upstream exchange.
#[derive(Debug)]
pub enum UpstreamOutcome {
    Completion(ChatCompletionResponse),
    Error { status: StatusCode, body: String },
}

/// Incremental state for folding chunk events into a completion.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    /// Raw bytes of the trailing partial line, carried across chunks.
    buffer: Vec<u8>,
    response_id: Option<String>,
    content_parts: Vec<String>,
    tool_calls: Vec<ToolCallBuilder>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug)]
struct ToolCallBuilder {
    id: Option<String>,
    kind: String,
    function: FunctionCall,
}

impl Default for ToolCallBuilder {
    fn default() -> Self {
        Self {
            id: None,
            kind: "function".to_string(),
            function: FunctionCall::default(),
        }
    }
}

impl StreamAccumulator {
    /// Feed one network chunk. Lines are split at the byte level and only
    /// decoded once complete, so a multibyte character arriving half in one
    /// chunk and half in the next stays intact.
    pub fn feed_bytes(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            self.feed_line(line.trim_end());
        }
    }

    /// Feed one SSE line. Lines that are not `data:` events, the `[DONE]`
    /// sentinel, and undecodable payloads are ignored.
    pub fn feed_line(&mut self, line: &str) {
        let Some(payload) = line.strip_prefix("data: ") else {
            return;
        };
        if payload == "[DONE]" {
            return;
        }
        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(_) => return,
        };

        if self.response_id.is_none() && !chunk.id.is_empty() {
            self.response_id = Some(chunk.id);
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.content_parts.push(content);
                }
            }

            for delta in choice.delta.tool_calls.into_iter().flatten() {
                let Some(index) = delta.index else { continue };
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCallBuilder::default());
                }
                let builder = &mut self.tool_calls[index];

                if let Some(function) = delta.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        builder.function.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        builder.function.arguments.push_str(&arguments);
                    }
                }
                if let Some(id) = delta.id {
                    builder.id = Some(id);
                }
                if let Some(kind) = delta.kind {
                    builder.kind = kind;
                }
            }

            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }

        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    /// Assemble the final completion. The model echoes the caller's
    /// requested name, never the upstream one.
    pub fn finish(mut self, requested_model: &str) -> ChatCompletionResponse {
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        self.feed_line(rest.trim_end());
        let now = chrono::Utc::now();
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_iter()
            .map(|b| ToolCall {
                id: b.id,
                kind: b.kind,
                function: b.function,
            })
            .collect();

        let message = if tool_calls.is_empty() {
            ResponseMessage {
                role: "assistant".to_string(),
                content: Some(self.content_parts.concat()),
                tool_calls: None,
            }
        } else {
            ResponseMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: Some(tool_calls),
            }
        };

        ChatCompletionResponse {
            id: self
                .response_id
                .unwrap_or_else(|| format!("chatcmpl-{}", now.timestamp_millis())),
            object: "chat.completion".to_string(),
            created: now.timestamp(),
            model: requested_model.to_string(),
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: Some(self.finish_reason.unwrap_or_else(|| "stop".to_string())),
            }],
            usage: Some(self.usage.unwrap_or_default()),
        }
    }
}

/// Map a buffered outcome into an HTTP response for the OpenAI surface.
pub fn buffered_to_response(outcome: UpstreamOutcome) -> Result<Response> {
    match outcome {
        UpstreamOutcome::Completion(completion) => {
            let body = serde_json::to_vec(&completion)?;
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .map_err(|e| GatewayError::Internal(e.to_string()))
        }
        UpstreamOutcome::Error { status, body } => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string())),
    }
}
