//! End-to-end tests for the HTTP surface against a mocked upstream.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use codebuddy_gateway::core::GatewayConfig;
use codebuddy_gateway::services::AccountStore;
use codebuddy_gateway::{router, GatewayState, TokenPool};

const CALLER_KEY: &str = "sk-test-key";

struct TestGateway {
    app: Router,
    state: Arc<GatewayState>,
    _dir: TempDir,
}

async fn gateway_with_tokens(upstream_url: &str, tokens: &[&str]) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let accounts_path = dir.path().join("accounts.txt");

    let mut content = String::from("# pool\n# format\n# ===\n");
    for (i, token) in tokens.iter().enumerate() {
        content.push_str(&format!("user{i}@x.com|pw|2025-01-01|outlook|{token}|r|e1|e2\n"));
    }
    tokio::fs::write(&accounts_path, content).await.unwrap();

    let config = GatewayConfig {
        upstream_base_url: upstream_url.trim_end_matches('/').to_string(),
        accounts_file: accounts_path.to_str().unwrap().to_string(),
        ..GatewayConfig::default()
    };

    let mut model_aliases = HashMap::new();
    model_aliases.insert("claude-4.0".to_string(), "claude-4.0-internal".to_string());
    model_aliases.insert("gpt-5".to_string(), "auto-chat".to_string());

    let mut caller_keys = HashSet::new();
    caller_keys.insert(CALLER_KEY.to_string());

    let store = AccountStore::new(&config.accounts_file);
    let pool = Arc::new(TokenPool::new(store.tokens().await.unwrap()).unwrap());

    let state = Arc::new(GatewayState {
        http: reqwest::Client::new(),
        config,
        store,
        pool,
        model_aliases,
        caller_keys,
    });

    TestGateway {
        app: router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn gateway(upstream_url: &str) -> TestGateway {
    gateway_with_tokens(upstream_url, &["tok-aaaa"]).await
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Authorization", format!("Bearer {CALLER_KEY}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn response_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_chunks() -> String {
    let chunks = [
        json!({"id": "chatcmpl-up1", "object": "chat.completion.chunk", "created": 1,
               "model": "claude-4.0-internal",
               "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]}),
        json!({"id": "chatcmpl-up1", "object": "chat.completion.chunk", "created": 1,
               "model": "claude-4.0-internal",
               "choices": [{"index": 0, "delta": {"content": "Hello"}, "finish_reason": null}]}),
        json!({"id": "chatcmpl-up1", "object": "chat.completion.chunk", "created": 1,
               "model": "claude-4.0-internal",
               "choices": [{"index": 0, "delta": {"content": ", world"}, "finish_reason": "stop"}],
               "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13}}),
    ];
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn mount_sse_upstream(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v2/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_chunks(), "text/event-stream"),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn missing_api_key_is_rejected() {
    let gateway = gateway("http://unused.invalid").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({"model": "claude-4.0", "messages": []}).to_string()))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");
    assert!(body["error"]["code"].is_null());
}

#[tokio::test]
async fn invalid_api_key_is_rejected() {
    let gateway = gateway("http://unused.invalid").await;

    let mut request = chat_request(json!({"model": "claude-4.0", "messages": []}));
    request.headers_mut().insert(
        "authorization",
        "Bearer sk-wrong".parse().unwrap(),
    );
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_model_names_the_model() {
    let gateway = gateway("http://unused.invalid").await;

    let request = chat_request(json!({"model": "gpt-9", "messages": []}));
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("gpt-9"));
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let gateway = gateway("http://unused.invalid").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Authorization", format!("Bearer {CALLER_KEY}"))
        .header("Content-Type", "application/json")
        .body(Body::from("{{{not json"))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn body_with_trailing_garbage_is_accepted() {
    let server = MockServer::start().await;
    mount_sse_upstream(&server).await;
    let gateway = gateway(&server.uri()).await;

    let payload = format!(
        "{}\nEXTRA",
        json!({"model": "claude-4.0", "messages": [{"role": "user", "content": "hi"}]})
    );
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Authorization", format!("Bearer {CALLER_KEY}"))
        .header("Content-Type", "application/json")
        .body(Body::from(payload))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn models_endpoint_lists_aliases() {
    let gateway = gateway("http://unused.invalid").await;

    let request = Request::builder()
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["claude-4.0", "gpt-5"]);
    assert_eq!(body["data"][0]["owned_by"], "anthropic");
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn buffered_completion_folds_upstream_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/chat/completions"))
        .and(header("authorization", "Bearer tok-aaaa"))
        .and(header("x-ide-type", "CodeBuddyIDE"))
        .and(body_partial_json(json!({
            "model": "claude-4.0-internal",
            "stream": true
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_chunks(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;
    let gateway = gateway(&server.uri()).await;

    let request = chat_request(json!({
        "model": "claude-4.0",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ]
    }));
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["id"], "chatcmpl-up1");
    // The caller sees the public model name, not the upstream one.
    assert_eq!(body["model"], "claude-4.0");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello, world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 13);
    assert!(body["choices"][0]["message"].get("tool_calls").is_none());

    // The upstream saw the repaired conversation: placeholder system message
    // first, then the original system prompt remapped to a user turn.
    let upstream_requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&upstream_requests[0].body).unwrap();
    assert_eq!(sent["messages"][0], json!({"role": "system", "content": "."}));
    assert_eq!(sent["messages"][1], json!({"role": "user", "content": "be brief"}));
    assert_eq!(sent["messages"][2], json!({"role": "user", "content": "hi"}));
}

#[tokio::test]
async fn streaming_completion_relays_upstream_bytes() {
    let server = MockServer::start().await;
    mount_sse_upstream(&server).await;
    let gateway = gateway(&server.uri()).await;

    let request = chat_request(json!({
        "model": "claude-4.0",
        "stream": true,
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let text = response_text(response).await;
    assert!(text.contains("\"content\":\"Hello\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn rate_limited_upstream_benches_token_and_relays_error() {
    let server = MockServer::start().await;
    let error_body = json!({
        "error": {"message": "usage exceeds frequency limit, reset at 2099-01-01 00:00:00 UTC+8"}
    });
    Mock::given(method("POST"))
        .and(path("/v2/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(error_body.clone()))
        .mount(&server)
        .await;
    let gateway = gateway(&server.uri()).await;

    let request = chat_request(json!({
        "model": "claude-4.0",
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let response = gateway.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = response_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("usage exceeds frequency limit"));

    let summary = gateway.state.pool.status_summary();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.available, 0);
    assert_eq!(summary.rate_limited, 1);

    // With the only token benched, the next request is refused up front.
    let request = chat_request(json!({
        "model": "claude-4.0",
        "messages": [{"role": "user", "content": "hi"}]
    }));
    let response = gateway.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "overloaded_error");
}

#[tokio::test]
async fn tokens_rotate_round_robin_across_requests() {
    let server = MockServer::start().await;
    mount_sse_upstream(&server).await;
    let gateway = gateway_with_tokens(&server.uri(), &["tok-aaaa", "tok-bbbb"]).await;

    for _ in 0..2 {
        let request = chat_request(json!({
            "model": "claude-4.0",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let response = gateway.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let requests = server.received_requests().await.unwrap();
    let auth_headers: Vec<String> = requests
        .iter()
        .map(|r| r.headers["authorization"].to_str().unwrap().to_string())
        .collect();
    assert_eq!(auth_headers, vec!["Bearer tok-aaaa", "Bearer tok-bbbb"]);
}

#[tokio::test]
async fn anthropic_surface_returns_message_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/chat/completions"))
        .and(body_partial_json(json!({"model": "claude-4.0-internal", "stream": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_chunks(), "text/event-stream"),
        )
        .mount(&server)
        .await;
    let gateway = gateway(&server.uri()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("x-api-key", CALLER_KEY)
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({
                "model": "claude-4.0",
                "max_tokens": 256,
                "system": "be brief",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "Hello, world");
    assert_eq!(body["stop_reason"], "stop_sequence");
    assert_eq!(body["usage"]["input_tokens"], 9);
    assert_eq!(body["usage"]["output_tokens"], 4);
}

#[tokio::test]
async fn anthropic_surface_streams_named_events() {
    let server = MockServer::start().await;
    mount_sse_upstream(&server).await;
    let gateway = gateway(&server.uri()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("Authorization", format!("Bearer {CALLER_KEY}"))
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({
                "model": "claude-4.0",
                "max_tokens": 256,
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let text = response_text(response).await;
    for event in [
        "event: message_start",
        "event: content_block_start",
        "event: content_block_delta",
        "event: content_block_stop",
        "event: message_delta",
        "event: message_stop",
    ] {
        assert!(text.contains(event), "missing {event} in:\n{text}");
    }
    assert!(text.contains("Hello, world"));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn anthropic_surface_wraps_errors_in_its_envelope() {
    let gateway = gateway("http://unused.invalid").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("x-api-key", "sk-wrong")
        .header("Content-Type", "application/json")
        .body(Body::from(
            json!({"model": "claude-4.0", "max_tokens": 1, "messages": []}).to_string(),
        ))
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn token_status_reports_redacted_detail() {
    let gateway =
        gateway_with_tokens("http://unused.invalid", &["tok-aaaa-bbbb-cccc-dddd"]).await;
    gateway
        .state
        .pool
        .mark_rate_limited("tok-aaaa-bbbb-cccc-dddd", "usage exceeds frequency limit")
        .await;

    let request = Request::builder()
        .uri("/v1/token/status")
        .body(Body::empty())
        .unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["summary"]["total"], 1);
    assert_eq!(body["summary"]["rate_limited"], 1);

    let token = body["tokens"][0]["token"].as_str().unwrap();
    assert!(token.contains("..."));
    assert!(!token.contains("bbbb-cccc"));
    assert_eq!(body["tokens"][0]["is_available"], false);
    assert!(body["current_time"].as_str().unwrap().ends_with("UTC"));
}

#[tokio::test]
async fn health_reports_resource_counts() {
    let gateway = gateway_with_tokens("http://unused.invalid", &["tok-a", "tok-b"]).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["accounts"], 2);
    assert_eq!(body["models"], 2);
    assert_eq!(body["api_keys"], 1);
}

#[tokio::test]
async fn root_reports_service_info() {
    let gateway = gateway("http://unused.invalid").await;

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = gateway.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["name"], "codebuddy-gateway");
    assert!(body["endpoints"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == "/v1/messages"));
}
