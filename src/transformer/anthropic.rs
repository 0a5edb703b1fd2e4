//! Translation between the OpenAI chat-completion schema and the Anthropic
//! message schema.
//!
//! Requests are translated on typed models so every content-block variant is
//! handled explicitly. Responses are translated on `serde_json::Value`
//! because upstream payloads are not always well-formed; malformed shapes
//! degrade into the protocol's own error object instead of failing the
//! request.

use crate::api::models::{
    AnthropicContent, AnthropicMessage, AnthropicRequest, AnthropicTool, ChatCompletionRequest,
    ChatMessage, ContentBlock, ContentPart, FunctionCall, ImageSource, MessageContent,
    StopSequences, SystemPrompt, ToolCall,
};
use serde_json::{json, Value};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Tool arguments arrive as a text-encoded JSON string. A string that does
/// not parse is wrapped verbatim rather than dropped.
fn parse_tool_arguments(arguments: &str) -> Value {
    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "Tool arguments are not valid JSON, passing through as string");
            Value::String(arguments.to_string())
        }
    }
}

fn stringify_tool_result(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(s) => s.clone(),
        other => serde_json::to_value(other)
            .map(|v| v.to_string())
            .unwrap_or_default(),
    }
}

/// Translate an OpenAI-style request into an Anthropic-style request.
///
/// System messages are lifted into the `system` field, `function` roles are
/// treated as assistant turns, data-URI images become base64 blocks, tool
/// calls become `tool_use` blocks and tool results become `tool_result`
/// blocks. Messages whose translated content is empty are dropped.
pub fn openai_request_to_anthropic(req: ChatCompletionRequest) -> AnthropicRequest {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();

    for msg in req.messages {
        if msg.role == "system" {
            if let Some(content) = &msg.content {
                system = Some(content.as_text());
            }
            continue;
        }

        let role = if msg.role == "function" { "assistant" } else { msg.role.as_str() };
        let mut blocks: Vec<ContentBlock> = Vec::new();

        match &msg.content {
            Some(MessageContent::Text(text)) if !text.is_empty() => {
                blocks.push(ContentBlock::Text { text: text.clone() });
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            blocks.push(ContentBlock::Text { text: text.clone() });
                        }
                        ContentPart::ImageUrl { image_url } => {
                            if let Some(block) = image_block_from_data_uri(image_url.url()) {
                                blocks.push(block);
                            }
                        }
                        ContentPart::Other(_) => {}
                    }
                }
            }
            _ => {}
        }

        for call in msg.tool_calls.iter().flatten() {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.clone().unwrap_or_default(),
                name: call.function.name.clone(),
                input: parse_tool_arguments(&call.function.arguments),
            });
        }

        if let Some(tool_call_id) = &msg.tool_call_id {
            let content = msg
                .content
                .as_ref()
                .map(stringify_tool_result)
                .unwrap_or_default();
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: Some(Value::String(content)),
            });
        }

        if !blocks.is_empty() {
            messages.push(AnthropicMessage {
                role: if role == "user" { "user" } else { "assistant" }.to_string(),
                content: AnthropicContent::Blocks(blocks),
            });
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .iter()
            .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("function"))
            .filter_map(|t| t.get("function"))
            .map(|f| AnthropicTool {
                name: f.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                description: f
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                input_schema: f.get("parameters").cloned().unwrap_or_else(|| json!({})),
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = req.tool_choice.as_ref().and_then(|choice| match choice {
        Value::String(s) if s == "auto" => Some(json!({"type": "auto"})),
        Value::String(s) if s == "none" => Some(json!({"type": "none"})),
        Value::Object(obj) if obj.get("type").and_then(|v| v.as_str()) == Some("function") => obj
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    });

    AnthropicRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: system.map(SystemPrompt::Text),
        stream: Some(req.stream.unwrap_or(false)),
        temperature: Some(req.temperature.unwrap_or(1.0)),
        top_p: req.top_p,
        stop_sequences: req.stop.map(StopSequences::into_vec),
        tools,
        tool_choice,
        extra: serde_json::Map::new(),
    }
}

fn image_block_from_data_uri(url: &str) -> Option<ContentBlock> {
    if !url.starts_with("data:") {
        return None;
    }
    let (head, data) = url.split_once(',')?;
    let media_type = head
        .trim_start_matches("data:")
        .split(';')
        .next()
        .unwrap_or_default();
    Some(ContentBlock::Image {
        source: ImageSource {
            kind: "base64".to_string(),
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
    })
}

/// Translate an Anthropic-style request into an OpenAI-style request.
///
/// The `system` field becomes a leading system message. Each `tool_result`
/// block becomes its own `tool`-role message, emitted before the user text
/// that followed it. `tool_use` blocks become assistant `tool_calls`.
pub fn anthropic_request_to_openai(req: AnthropicRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        messages.push(ChatMessage::text("system", &system.as_text()));
    }

    for msg in req.messages {
        match msg.content {
            AnthropicContent::Text(text) => {
                messages.push(ChatMessage::text(&msg.role, &text));
            }
            AnthropicContent::Blocks(blocks) => {
                let mut parts: Vec<ContentPart> = Vec::new();
                let mut has_image = false;
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                let mut tool_results: Vec<ChatMessage> = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(ContentPart::Text { text });
                        }
                        ContentBlock::Image { source } => {
                            has_image = true;
                            let url = format!("data:{};base64,{}", source.media_type, source.data);
                            parts.push(ContentPart::ImageUrl {
                                image_url: crate::api::models::ImageUrlData::Url(url),
                            });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCall {
                                id: Some(id),
                                kind: "function".to_string(),
                                function: FunctionCall {
                                    name,
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        ContentBlock::ToolResult { tool_use_id, content } => {
                            let text = match content {
                                Some(Value::String(s)) => s,
                                Some(other) => other.to_string(),
                                None => String::new(),
                            };
                            tool_results.push(ChatMessage {
                                role: "tool".to_string(),
                                content: Some(MessageContent::Text(text)),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id),
                                name: None,
                            });
                        }
                    }
                }

                messages.extend(tool_results);

                if !parts.is_empty() || !tool_calls.is_empty() {
                    let content = if has_image {
                        Some(MessageContent::Parts(parts))
                    } else {
                        let text: String = parts
                            .iter()
                            .filter_map(|p| match p {
                                ContentPart::Text { text } => Some(text.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        if text.is_empty() { None } else { Some(MessageContent::Text(text)) }
                    };
                    messages.push(ChatMessage {
                        role: msg.role.clone(),
                        content,
                        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                        tool_call_id: None,
                        name: None,
                    });
                }
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = req.tool_choice.as_ref().and_then(|choice| {
        match choice.get("type").and_then(|v| v.as_str()) {
            Some("auto") | Some("any") => Some(Value::String("auto".to_string())),
            Some("none") => Some(Value::String("none".to_string())),
            Some("tool") => choice
                .get("name")
                .and_then(|n| n.as_str())
                .map(|name| json!({"type": "function", "function": {"name": name}})),
            _ => None,
        }
    });

    ChatCompletionRequest {
        model: req.model,
        messages,
        stream: req.stream,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.map(StopSequences::Many),
        tools,
        tool_choice,
        extra: serde_json::Map::new(),
    }
}

/// Translate a complete OpenAI-style response into an Anthropic-style
/// message object. Error responses keep the Anthropic error envelope.
pub fn openai_response_to_anthropic(openai_resp: &Value) -> Value {
    if let Some(error) = openai_resp.get("error") {
        return json!({
            "type": "error",
            "error": {
                "type": error.get("type").and_then(|v| v.as_str()).unwrap_or("api_error"),
                "message": error.get("message").and_then(|v| v.as_str()).unwrap_or("Unknown error"),
            }
        });
    }

    let choice = match openai_resp.get("choices").and_then(|c| c.get(0)) {
        Some(choice) => choice,
        None => {
            return json!({
                "type": "error",
                "error": {
                    "type": "invalid_response",
                    "message": "No choices in upstream response",
                }
            });
        }
    };
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    for call in message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
    {
        let function = call.get("function").cloned().unwrap_or_else(|| json!({}));
        let arguments = function.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
            "name": function.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
            "input": parse_tool_arguments(arguments),
        }));
    }
    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let stop_reason = match choice.get("finish_reason").and_then(|v| v.as_str()) {
        Some("length") => "max_tokens",
        Some("stop") => "stop_sequence",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    };

    let usage = openai_resp.get("usage").cloned().unwrap_or_else(|| json!({}));
    let response_id = openai_resp
        .get("id")
        .and_then(|v| v.as_str())
        .map(|id| id.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    json!({
        "id": format!("msg_{response_id}"),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": openai_resp.get("model").and_then(|v| v.as_str()).unwrap_or("unknown"),
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            "output_tokens": usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        }
    })
}

/// Translate a complete Anthropic-style message into an OpenAI-style
/// completion object. Error responses keep the OpenAI error envelope.
pub fn anthropic_response_to_openai(anthropic_resp: &Value) -> Value {
    if anthropic_resp.get("type").and_then(|v| v.as_str()) == Some("error") {
        let error = anthropic_resp.get("error").cloned().unwrap_or_else(|| json!({}));
        return json!({
            "error": {
                "message": error.get("message").and_then(|v| v.as_str()).unwrap_or("Unknown error"),
                "type": error.get("type").and_then(|v| v.as_str()).unwrap_or("api_error"),
                "code": null,
            }
        });
    }

    let blocks = match anthropic_resp.get("content").and_then(|v| v.as_array()) {
        Some(blocks) => blocks,
        None => {
            return json!({
                "error": {
                    "message": "No content in upstream response",
                    "type": "invalid_response",
                    "code": null,
                }
            });
        }
    };

    let mut content_text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                content_text.push_str(block.get("text").and_then(|v| v.as_str()).unwrap_or(""));
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                        "arguments": block.get("input").cloned().unwrap_or_else(|| json!({})).to_string(),
                    }
                }));
            }
            _ => {}
        }
    }

    let mut message = serde_json::Map::new();
    message.insert("role".to_string(), json!("assistant"));
    if !content_text.is_empty() {
        message.insert("content".to_string(), json!(content_text));
    }
    if !tool_calls.is_empty() {
        message.insert("tool_calls".to_string(), json!(tool_calls));
    }

    let finish_reason = match anthropic_resp.get("stop_reason").and_then(|v| v.as_str()) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let usage = anthropic_resp.get("usage").cloned().unwrap_or_else(|| json!({}));
    let input_tokens = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);

    json!({
        "id": format!("chatcmpl-{}", &uuid::Uuid::new_v4().simple().to_string()[..29]),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": anthropic_resp.get("model").and_then(|v| v.as_str()).unwrap_or("unknown"),
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason,
            "logprobs": null,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
        "system_fingerprint": null,
    })
}

/// Build the synthetic Anthropic event sequence for a complete message:
/// `message_start`, then start/delta/stop per content block, `message_delta`
/// with the stop reason, `message_stop`, and the terminal `data: [DONE]`.
pub fn anthropic_sse_events(anthropic_resp: &Value) -> Vec<String> {
    let mut events = Vec::new();

    let message_start = json!({
        "type": "message_start",
        "message": {
            "id": anthropic_resp.get("id").cloned().unwrap_or_else(|| json!("msg_unknown")),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": anthropic_resp.get("model").cloned().unwrap_or_else(|| json!("unknown")),
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {
                "input_tokens": anthropic_resp["usage"].get("input_tokens").cloned().unwrap_or(json!(0)),
                "output_tokens": anthropic_resp["usage"].get("output_tokens").cloned().unwrap_or(json!(0)),
                "cache_creation_input_tokens": 0,
                "cache_read_input_tokens": 0,
            }
        }
    });
    events.push(named_event("message_start", &message_start));

    let empty = Vec::new();
    let blocks = anthropic_resp
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    for (index, block) in blocks.iter().enumerate() {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("tool_use") => {
                let start = json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": block.get("id").cloned().unwrap_or_default(),
                        "name": block.get("name").cloned().unwrap_or_default(),
                        "input": {},
                    }
                });
                events.push(named_event("content_block_start", &start));

                let delta = json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {
                        "type": "input_json_delta",
                        "partial_json": block.get("input").cloned().unwrap_or_else(|| json!({})).to_string(),
                    }
                });
                events.push(named_event("content_block_delta", &delta));
            }
            _ => {
                let start = json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                });
                events.push(named_event("content_block_start", &start));

                let delta = json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {
                        "type": "text_delta",
                        "text": block.get("text").and_then(|v| v.as_str()).unwrap_or(""),
                    }
                });
                events.push(named_event("content_block_delta", &delta));
            }
        }

        let stop = json!({"type": "content_block_stop", "index": index});
        events.push(named_event("content_block_stop", &stop));
    }

    let message_delta = json!({
        "type": "message_delta",
        "delta": {
            "stop_reason": anthropic_resp.get("stop_reason").cloned().unwrap_or(json!("end_turn")),
            "stop_sequence": null,
        },
        "usage": {
            "output_tokens": anthropic_resp["usage"].get("output_tokens").cloned().unwrap_or(json!(0)),
        }
    });
    events.push(named_event("message_delta", &message_delta));
    events.push(named_event("message_stop", &json!({"type": "message_stop"})));
    events.push("data: [DONE]\n\n".to_string());

    events
}

/// Build the synthetic OpenAI chunk sequence for a complete completion:
/// a role chunk, a content chunk, a finish chunk carrying usage, and the
/// terminal `data: [DONE]`.
pub fn openai_sse_chunks(openai_resp: &Value) -> Vec<String> {
    let chunk_id = openai_resp
        .get("id")
        .and_then(|v| v.as_str())
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("chatcmpl-{}", &uuid::Uuid::new_v4().simple().to_string()[..29]));
    let created = openai_resp
        .get("created")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let model = openai_resp
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let chunk = |delta: Value, finish_reason: Value, usage: Option<&Value>| -> String {
        let mut body = json!({
            "id": chunk_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        if let Some(usage) = usage {
            body["usage"] = usage.clone();
        }
        format!("data: {body}\n\n")
    };

    let message = openai_resp
        .pointer("/choices/0/message")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let finish_reason = openai_resp
        .pointer("/choices/0/finish_reason")
        .cloned()
        .unwrap_or(json!("stop"));

    let mut chunks = Vec::new();
    chunks.push(chunk(json!({"role": "assistant"}), Value::Null, None));

    if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
        if !content.is_empty() {
            chunks.push(chunk(json!({"content": content}), Value::Null, None));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        let deltas: Vec<Value> = tool_calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                let mut delta = call.clone();
                delta["index"] = json!(i);
                delta
            })
            .collect();
        chunks.push(chunk(json!({"tool_calls": deltas}), Value::Null, None));
    }

    chunks.push(chunk(json!({}), finish_reason, openai_resp.get("usage")));
    chunks.push("data: [DONE]\n\n".to_string());

    chunks
}

fn named_event(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}
