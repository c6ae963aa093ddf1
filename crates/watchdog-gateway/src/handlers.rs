//! Request handlers.
//!
//! `/chat` runs the loop to completion and returns the settled report. `/chat-stream` runs the
//! same loop on a spawned task and relays its events as SSE; each `data:` field is one JSON
//! event tagged by `status`. When the client disconnects, the task is aborted.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use watchdog_core::{
    ChatReport, LoopError, LoopEvent, LoopOutcome, StreamReporter, Turn, DEFAULT_SESSION,
};

use crate::app::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ChatRequest {
    fn session(&self) -> &str {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SESSION)
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.message.trim().is_empty() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "message must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct WatchdogRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct WatchdogReply {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub turns: Vec<Turn>,
}

pub async fn health() -> &'static str {
    "OK"
}

/// POST /chat
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatReport>, ApiError> {
    req.validate()?;
    let session = req.session();
    tracing::info!(target: "watchdog::http", session, "chat");
    let outcome = state
        .safety
        .converse(&state.store, session, &req.message, None)
        .await?;
    Ok(Json(ChatReport::from(&outcome)))
}

/// Aborts the loop task if the response stream is dropped before the task finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// POST /chat-stream
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    req.validate()?;
    // Taken before streaming starts so a busy session is a plain 409, not a broken stream.
    let mut session = state.store.acquire(req.session())?;
    tracing::info!(target: "watchdog::http", session = session.session_id(), "chat stream");

    let (reporter, mut events) = StreamReporter::channel(state.stream_buffer);
    let safety = Arc::clone(&state.safety);
    let message = req.message;
    let task = AbortOnDrop(tokio::spawn(async move {
        safety.run(&mut session, &message, Some(&reporter)).await
    }));

    let body = stream! {
        let mut task = task;
        while let Some(event) = events.recv().await {
            if let Some(sse) = to_sse(&event) {
                yield Ok(sse);
            }
        }
        // The channel closes once the task drops its reporter.
        if let Some(message) = failure_message((&mut task.0).await) {
            yield Ok(error_event(&message));
        }
    };

    Ok(Sse::new(body).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn to_sse(event: &LoopEvent) -> Option<Event> {
    match Event::default().json_data(event) {
        Ok(sse) => Some(sse),
        Err(err) => {
            tracing::warn!(target: "watchdog::http", status = event.status(), error = %err, "dropping unserializable event");
            None
        }
    }
}

fn error_event(message: &str) -> Event {
    Event::default()
        .json_data(serde_json::json!({ "status": "error", "message": message }))
        .unwrap_or_else(|_| Event::default().data(r#"{"status":"error"}"#))
}

/// What to tell the client after the event channel closed, if anything.
fn failure_message(
    joined: Result<Result<LoopOutcome, LoopError>, tokio::task::JoinError>,
) -> Option<String> {
    match joined {
        Ok(Ok(_)) | Ok(Err(LoopError::Cancelled)) => None,
        Ok(Err(err)) => {
            tracing::warn!(target: "watchdog::http", error = %err, "stream loop failed");
            Some(err.to_string())
        }
        Err(err) => {
            tracing::error!(target: "watchdog::http", error = %err, "stream loop task failed");
            Some("internal error".to_string())
        }
    }
}

/// POST /watchdog: one-shot assessment of arbitrary text, outside the loop.
pub async fn watchdog(
    State(state): State<AppState>,
    Json(req): Json<WatchdogRequest>,
) -> Result<Json<WatchdogReply>, ApiError> {
    let response = state.safety.watchdog().assess_raw(&req.message).await?;
    Ok(Json(WatchdogReply { response }))
}

/// GET /sessions/:id/history
pub async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionHistory>, ApiError> {
    let turns = state
        .store
        .snapshot(&session_id)?
        .ok_or_else(|| ApiError::not_found(format!("session '{session_id}' not found")))?;
    Ok(Json(SessionHistory { session_id, turns }))
}
