//! HTTP endpoint handlers and router assembly.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::auth::{authenticate, AuthFormat};
use crate::api::models::{
    AnthropicRequest, ChatMessage, HealthResponse, ModelInfo, ModelList, TokenStatusResponse,
};
use crate::api::streaming::{
    buffered_to_response, collect_buffered_response, relay_upstream_stream, sse_response,
    UpstreamOutcome,
};
use crate::api::upstream::codebuddy_headers;
use crate::core::{parse_lenient, GatewayConfig, GatewayError, Result};
use crate::services::{AccountStore, TokenPool};
use crate::transformer::{
    anthropic_request_to_openai, anthropic_sse_events, openai_response_to_anthropic,
    prepare_upstream_messages,
};

/// Shared state for all endpoints.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub store: AccountStore,
    pub pool: Arc<TokenPool>,
    pub model_aliases: HashMap<String, String>,
    pub caller_keys: HashSet<String>,
    pub http: reqwest::Client,
}

impl GatewayState {
    fn resolve_model(&self, model: &str) -> Result<String> {
        self.model_aliases
            .get(model)
            .cloned()
            .ok_or_else(|| GatewayError::ModelNotFound(model.to_string()))
    }
}

/// Assemble the full route table.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/token/status", get(token_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// OpenAI surface
// ============================================================================

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    authenticate(&state, &headers, AuthFormat::BearerOnly)?;

    let mut body = parse_lenient(&body)?;
    let requested_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let upstream_model = state.resolve_model(&requested_model)?;
    body["model"] = json!(upstream_model);

    let request_id = format!("req-{}", chrono::Utc::now().timestamp_millis());
    let messages: Vec<ChatMessage> = body
        .get("messages")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| GatewayError::BadRequest(format!("Invalid messages: {e}")))?
        .unwrap_or_default();
    let transformed = prepare_upstream_messages(messages, &request_id);
    body["messages"] = serde_json::to_value(transformed)?;

    let caller_wants_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    // The upstream is always driven in streaming mode; the caller's choice
    // only decides whether the events are relayed or folded.
    body["stream"] = json!(true);

    let auth_token = state.pool.next_token().await?;
    let upstream_headers = codebuddy_headers(&auth_token)?;

    tracing::info!(
        %request_id,
        model = %requested_model,
        upstream_model = %upstream_model,
        stream = caller_wants_stream,
        "Dispatching chat completion"
    );

    let response = state
        .http
        .post(state.config.upstream_chat_url())
        .headers(upstream_headers)
        .json(&body)
        .send()
        .await?;

    if caller_wants_stream {
        relay_upstream_stream(response, state.pool.clone(), auth_token).await
    } else {
        let outcome =
            collect_buffered_response(response, &requested_model, &state.pool, &auth_token).await?;
        buffered_to_response(outcome)
    }
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<Arc<GatewayState>>) -> Json<ModelList> {
    let created = chrono::Utc::now().timestamp();
    let mut data: Vec<ModelInfo> = state
        .model_aliases
        .keys()
        .map(|id| ModelInfo {
            id: id.clone(),
            object: "model".to_string(),
            created,
            owned_by: "anthropic".to_string(),
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));

    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

// ============================================================================
// Anthropic surface
// ============================================================================

/// `POST /v1/messages`
///
/// Errors on this surface wear the Anthropic error envelope, so the fallible
/// body is wrapped and mapped here.
pub async fn messages(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match messages_inner(state, headers, body).await {
        Ok(response) => response,
        Err(e) => e.to_anthropic_response(),
    }
}

async fn messages_inner(
    state: Arc<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    authenticate(&state, &headers, AuthFormat::MultiFormat)?;

    let parsed = parse_lenient(&body)?;
    let request: AnthropicRequest = serde_json::from_value(parsed)
        .map_err(|e| GatewayError::BadRequest(format!("Invalid request body: {e}")))?;

    let requested_model = request.model.clone();
    let upstream_model = state.resolve_model(&requested_model)?;
    let caller_wants_stream = request.stream.unwrap_or(false);

    let mut openai_request = anthropic_request_to_openai(request);
    openai_request.model = upstream_model.clone();

    let request_id = format!("req-{}", chrono::Utc::now().timestamp_millis());
    openai_request.messages = prepare_upstream_messages(openai_request.messages, &request_id);

    let mut body = serde_json::to_value(openai_request)?;
    body["stream"] = json!(true);

    let auth_token = state.pool.next_token().await?;
    let upstream_headers = codebuddy_headers(&auth_token)?;

    tracing::info!(
        %request_id,
        model = %requested_model,
        upstream_model = %upstream_model,
        stream = caller_wants_stream,
        "Dispatching message request"
    );

    let response = state
        .http
        .post(state.config.upstream_chat_url())
        .headers(upstream_headers)
        .json(&body)
        .send()
        .await?;

    let outcome =
        collect_buffered_response(response, &requested_model, &state.pool, &auth_token).await?;

    match outcome {
        UpstreamOutcome::Completion(completion) => {
            let openai_response = serde_json::to_value(completion)?;
            let anthropic_response = openai_response_to_anthropic(&openai_response);
            if caller_wants_stream {
                Ok(sse_response(anthropic_sse_events(&anthropic_response)))
            } else {
                Ok((StatusCode::OK, Json(anthropic_response)).into_response())
            }
        }
        UpstreamOutcome::Error { status, body } => {
            let message = match serde_json::from_str::<Value>(&body) {
                Ok(parsed) => parsed
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
                    .unwrap_or(body),
                Err(_) => body,
            };
            let envelope = json!({
                "type": "error",
                "error": {"type": "upstream_error", "message": message}
            });
            Ok((status, Json(envelope)).into_response())
        }
    }
}

// ============================================================================
// Operational surface
// ============================================================================

/// `GET /v1/token/status`
pub async fn token_status(State(state): State<Arc<GatewayState>>) -> Json<TokenStatusResponse> {
    Json(TokenStatusResponse {
        summary: state.pool.status_summary(),
        tokens: state.pool.token_details().await,
        current_time: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    })
}

/// `GET /health`
pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    let accounts = match state.store.load().await {
        Ok(records) => records.len(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read account store");
            0
        }
    };

    Json(HealthResponse {
        status: "healthy".to_string(),
        accounts,
        models: state.model_aliases.len(),
        api_keys: state.caller_keys.len(),
    })
}

/// `GET /`
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/v1/models",
            "/v1/chat/completions",
            "/v1/messages",
            "/v1/token/status",
            "/health",
        ],
    }))
}
