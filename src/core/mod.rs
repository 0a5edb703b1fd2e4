//! Core functionality: configuration, errors, and lenient JSON parsing.

pub mod config;
pub mod error;
pub mod json;

pub use config::{load_caller_keys, load_model_aliases, GatewayConfig};
pub use error::{GatewayError, Result};
pub use json::parse_lenient;
