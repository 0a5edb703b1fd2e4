//! CodeBuddy Gateway
//!
//! An OpenAI- and Anthropic-compatible HTTP gateway that multiplexes a pool
//! of harvested upstream access tokens behind a stable set of caller API
//! keys. Requests are authenticated, their model names resolved through an
//! alias map, their conversations repaired for the upstream's quirks, and
//! then dispatched with round-robin token rotation; tokens that hit the
//! upstream frequency limit are benched until their advertised reset time.
//!
//! # Architecture
//!
//! - [`core`] — configuration, error types, lenient JSON parsing
//! - [`services`] — the flat-file account store and the token pool
//! - [`transformer`] — conversation repair and protocol translation
//! - [`api`] — wire models, authentication, handlers, upstream client

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

pub use api::{router, GatewayState};
pub use core::{GatewayConfig, GatewayError, Result};
pub use services::{AccountStore, TokenPool};
