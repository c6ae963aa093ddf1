//! Watchdog gateway: HTTP front for the safety-gated chat loop.
//! `POST /chat`, `POST /chat-stream` (SSE), `POST /watchdog`, `GET /sessions/:id/history`, `GET /health`.

mod app;
mod error;
mod handlers;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchdog_core::{
    ChatCompletionsGateway, LlmMode, MockGateway, ModelGateway, WatchdogConfig,
};

use crate::app::{build_app, spawn_session_sweeper, AppState};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(target: "watchdog::gateway", error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = WatchdogConfig::load()?;

    let gateway: Arc<dyn ModelGateway> = match config.llm_mode {
        LlmMode::Mock => Arc::new(MockGateway::for_demo(
            &config.generator_model,
            &config.watchdog_model,
        )),
        LlmMode::Live => Arc::new(ChatCompletionsGateway::from_config(&config)?),
    };
    tracing::info!(
        target: "watchdog::gateway",
        mode = ?config.llm_mode,
        generator = %config.generator_model,
        watchdog = %config.watchdog_model,
        max_attempts = config.max_attempts,
        "model gateway ready"
    );

    let state = AppState::new(gateway, &config);
    let _sweeper = spawn_session_sweeper(Arc::clone(&state.store), config.session_ttl());
    let app = build_app(state, &config.cors_origins);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "watchdog::gateway", %addr, version = watchdog_core::version(), "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
