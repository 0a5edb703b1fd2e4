use anyhow::Result;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codebuddy_gateway::api::upstream::build_http_client;
use codebuddy_gateway::core::{load_caller_keys, load_model_aliases, GatewayConfig};
use codebuddy_gateway::services::token_pool::BACKGROUND_SWEEP_SECS;
use codebuddy_gateway::{router, AccountStore, GatewayState, TokenPool};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(worker_threads) = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    {
        builder.worker_threads(worker_threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async_main())
}

/// Time formatter that uses the local timezone (respects TZ).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    // Noise suppression for HTTP libraries is appended unconditionally so a
    // blanket RUST_LOG=debug does not let hyper's per-chunk logs through.
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,codebuddy_gateway=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{base_filter},hyper=warn,h2=warn,reqwest=warn"
    ));

    let no_color = std::env::var("NO_COLOR").is_ok();
    if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }
}

async fn async_main() -> Result<()> {
    init_tracing();

    let config = GatewayConfig::from_env()?;

    let model_aliases = load_model_aliases(&config.models_file)?;
    let caller_keys = load_caller_keys(&config.client_keys_file)?;
    tracing::info!(
        models = model_aliases.len(),
        api_keys = caller_keys.len(),
        "Loaded model aliases and caller keys"
    );

    let store = AccountStore::new(&config.accounts_file);
    let tokens = store.tokens().await?;
    tracing::info!(count = tokens.len(), "Loaded access tokens from account store");

    let pool = Arc::new(TokenPool::new(tokens)?);
    let http = build_http_client(&config)?;

    let host = config.host.clone();
    let port = config.port;

    let state = Arc::new(GatewayState {
        config,
        store,
        pool: pool.clone(),
        model_aliases,
        caller_keys,
        http,
    });

    // Periodic recovery so benched tokens come back even while no traffic
    // is flowing.
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(BACKGROUND_SWEEP_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            let recovered = pool.recover_due_tokens().await;
            if recovered > 0 {
                tracing::info!(count = recovered, "Background sweep recovered tokens");
            }
        }
    });

    let app = router(state);
    let addr = format!("{host}:{port}");
    tracing::info!("Starting CodeBuddy gateway on {addr}");
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Anthropic API: /v1/messages");
    tracing::info!("Status: /v1/token/status, /health");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    sweeper.abort();
    Ok(())
}
