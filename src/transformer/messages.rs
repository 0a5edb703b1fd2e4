//! Conversation repair and role remapping applied before every upstream
//! dispatch.
//!
//! The upstream endpoint rejects conversations where an assistant tool-call
//! turn is not immediately followed by its tool results, which happens when
//! a client interrupts a tool loop with a fresh user message. It also
//! rejects `system` roles anywhere but a single leading placeholder. Both
//! quirks are absorbed here so callers can send ordinary OpenAI-style
//! histories.

use crate::api::models::{ChatMessage, MessageContent};
use std::collections::HashSet;

/// Full pipeline: repair tool-call sequences, remap `system` roles to
/// `user`, then prepend the single `system` placeholder the upstream
/// expects.
pub fn prepare_upstream_messages(messages: Vec<ChatMessage>, request_id: &str) -> Vec<ChatMessage> {
    let mut transformed = transform_messages(messages, request_id);
    transformed.insert(0, ChatMessage::text("system", "."));
    transformed
}

/// Repair tool-call sequences, then turn every `system` message into a
/// `user` message. All other fields are carried over untouched.
pub fn transform_messages(messages: Vec<ChatMessage>, request_id: &str) -> Vec<ChatMessage> {
    let messages = repair_tool_call_sequence(messages, request_id);

    let mut remapped = 0usize;
    let transformed: Vec<ChatMessage> = messages
        .into_iter()
        .enumerate()
        .map(|(i, mut message)| {
            if message.role == "system" {
                message.role = "user".to_string();
                remapped += 1;
                tracing::debug!(
                    request_id,
                    index = i + 1,
                    preview = %content_preview(&message.content),
                    "Remapped system message to user"
                );
            }
            message
        })
        .collect();

    if remapped > 0 {
        tracing::info!(request_id, count = remapped, "Remapped system messages to user role");
    }

    transformed
}

/// Re-group each assistant tool-call turn with its tool results.
///
/// After an assistant message carrying `tool_calls`, subsequent messages are
/// scanned: tool results are collected (results whose id does not match any
/// expected id are kept, with a warning), user messages are held aside, and
/// any other role ends the window. The window is then emitted as assistant,
/// tool results, held user messages, in that order. Missing results are
/// logged but the sequence is emitted as-is.
pub fn repair_tool_call_sequence(
    messages: Vec<ChatMessage>,
    request_id: &str,
) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let mut fixed = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(current) = iter.next() {
        let has_tool_calls = current.role == "assistant"
            && current.tool_calls.as_ref().map_or(false, |tc| !tc.is_empty());

        if !has_tool_calls {
            fixed.push(current);
            continue;
        }

        let expected_ids: HashSet<String> = current
            .tool_calls
            .iter()
            .flatten()
            .filter_map(|tc| tc.id.clone())
            .collect();

        fixed.push(current);

        let mut tool_results = Vec::new();
        let mut found_ids: HashSet<String> = HashSet::new();
        let mut held_users = Vec::new();

        while let Some(next) = iter.peek() {
            if next.role == "tool" && next.tool_call_id.is_some() {
                let result = iter.next().unwrap();
                let id = result.tool_call_id.clone().unwrap_or_default();
                if expected_ids.contains(&id) {
                    tracing::debug!(request_id, tool_call_id = %id, "Matched tool result");
                    found_ids.insert(id);
                } else {
                    tracing::warn!(request_id, tool_call_id = %id, "Tool result id does not match any pending call");
                }
                tool_results.push(result);
            } else if next.role == "user" {
                tracing::debug!(request_id, "Holding interleaved user message until tool results are emitted");
                held_users.push(iter.next().unwrap());
            } else {
                // New assistant turn or any other role closes the window.
                break;
            }
        }

        let missing: Vec<&String> = expected_ids.difference(&found_ids).collect();
        if !missing.is_empty() {
            tracing::warn!(request_id, ?missing, "Tool calls without matching results");
        }

        if !tool_results.is_empty() {
            tracing::info!(
                request_id,
                found = tool_results.len(),
                expected = expected_ids.len(),
                "Regrouped tool-call sequence"
            );
        }
        if !held_users.is_empty() {
            tracing::info!(
                request_id,
                count = held_users.len(),
                "Moved interleaved user messages after tool results"
            );
        }

        fixed.extend(tool_results);
        fixed.extend(held_users);
    }

    fixed
}

fn content_preview(content: &Option<MessageContent>) -> String {
    let text = match content {
        Some(c) => c.as_text(),
        None => String::new(),
    };
    if text.chars().count() > 100 {
        let truncated: String = text.chars().take(100).collect();
        format!("{truncated}...")
    } else {
        text
    }
}
