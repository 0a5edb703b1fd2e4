//! Conversation repair and protocol translation.

pub mod anthropic;
pub mod messages;

pub use anthropic::{
    anthropic_request_to_openai, anthropic_response_to_openai, anthropic_sse_events,
    openai_request_to_anthropic, openai_response_to_anthropic, openai_sse_chunks,
};
pub use messages::{prepare_upstream_messages, repair_tool_call_sequence, transform_messages};
