//! HTTP layer: authentication, wire models, handlers, and upstream plumbing.

pub mod auth;
pub mod handlers;
pub mod models;
pub mod streaming;
pub mod upstream;

pub use handlers::{router, GatewayState};
pub use models::{AnthropicRequest, ChatCompletionRequest, ChatCompletionResponse, ChatMessage};
