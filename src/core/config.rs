//! Configuration management for the gateway.
//!
//! Runtime settings come from environment variables (with `.env` support via
//! `dotenvy` in `main`); the model alias map and caller API-key set are loaded
//! from companion JSON files next to the account file.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::collections::HashSet;

/// Main gateway configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to
    pub port: u16,

    /// Pipe-delimited account/credential store
    pub accounts_file: String,

    /// JSON object mapping public model name -> upstream model name
    pub models_file: String,

    /// JSON array of caller API keys
    pub client_keys_file: String,

    /// Upstream base URL (chat completions live under /v2/chat/completions)
    pub upstream_base_url: String,

    /// Upstream request timeout in seconds. Long completions need minutes.
    pub request_timeout_secs: u64,

    /// Whether to verify SSL certificates for upstream requests
    pub verify_ssl: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            accounts_file: "codebuddy_accounts.txt".to_string(),
            models_file: "models.json".to_string(),
            client_keys_file: "client.json".to_string(),
            upstream_base_url: "https://www.codebuddy.ai".to_string(),
            request_timeout_secs: 600,
            verify_ssl: true,
        }
    }
}

impl GatewayConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            config.port = port_str
                .parse::<u16>()
                .with_context(|| format!("Invalid PORT value: {}", port_str))?;
        }

        if let Ok(path) = std::env::var("ACCOUNTS_FILE") {
            config.accounts_file = path;
        }

        if let Ok(path) = std::env::var("MODELS_FILE") {
            config.models_file = path;
        }

        if let Ok(path) = std::env::var("CLIENT_KEYS_FILE") {
            config.client_keys_file = path;
        }

        if let Ok(url) = std::env::var("UPSTREAM_BASE_URL") {
            config.upstream_base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(timeout_str) = std::env::var("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = timeout_str
                .parse::<u64>()
                .with_context(|| format!("Invalid REQUEST_TIMEOUT_SECS value: {}", timeout_str))?;
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            config.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        Ok(config)
    }

    /// Full URL of the upstream chat-completions endpoint.
    pub fn upstream_chat_url(&self) -> String {
        format!("{}/v2/chat/completions", self.upstream_base_url)
    }
}

/// Load the model alias map: a JSON object of public name -> upstream name.
///
/// Unreadable or malformed files are fatal at startup.
pub fn load_model_aliases(path: &str) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model alias file: {}", path))?;

    let map: HashMap<String, String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse model alias file: {}", path))?;

    tracing::info!("Loaded {} model aliases from {}", map.len(), path);
    Ok(map)
}

/// Load the caller API-key set: a JSON array of authorized key strings.
pub fn load_caller_keys(path: &str) -> Result<HashSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read caller key file: {}", path))?;

    let keys: Vec<String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse caller key file: {}", path))?;

    tracing::info!("Loaded {} caller API keys from {}", keys.len(), path);
    Ok(keys.into_iter().collect())
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
