//! Router, shared state and background session sweeping.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use watchdog_core::{ConversationStore, ModelGateway, SafetyLoop, WatchdogConfig};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub safety: Arc<SafetyLoop>,
    pub store: Arc<ConversationStore>,
    pub stream_buffer: usize,
}

impl AppState {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: &WatchdogConfig) -> Self {
        Self {
            safety: Arc::new(SafetyLoop::new(gateway, config)),
            store: Arc::new(ConversationStore::new(config.session_ttl(), config.max_sessions)),
            stream_buffer: config.stream_buffer,
        }
    }
}

pub fn build_app(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route("/chat-stream", post(handlers::chat_stream))
        .route("/watchdog", post(handlers::watchdog))
        .route("/sessions/:id/history", get(handlers::session_history))
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

/// Any origin unless an explicit allow-list is configured.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(target: "watchdog::gateway", origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(allowed))
}

/// Periodically drop sessions idle past the TTL.
pub fn spawn_session_sweeper(
    store: Arc<ConversationStore>,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    let every = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = store.evict_expired();
            tracing::debug!(target: "watchdog::store", evicted, live = store.len(), "session sweep");
        }
    })
}
