//! Progress events emitted while a loop runs, and the settled report returned to clients.
//!
//! Events serialize as JSON objects tagged by `status`, e.g.
//! `{"status":"generator_response_chunk","attempt":1,"chunk":"Hel","accumulated":"Hel"}`.

use serde::{Deserialize, Serialize};

use crate::safety_loop::LoopOutcome;

/// Settled result of one loop, as returned by `POST /chat` and carried by the terminal
/// `complete` / `failed` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReport {
    pub response: String,
    pub attempts: usize,
    pub flagged: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub generator_response: String,
    #[serde(default)]
    pub watchdog_response: String,
    #[serde(default)]
    pub all_generator_responses: Vec<String>,
    #[serde(default)]
    pub all_watchdog_responses: Vec<String>,
}

impl From<&LoopOutcome> for ChatReport {
    fn from(outcome: &LoopOutcome) -> Self {
        let last = outcome.attempts.last();
        Self {
            response: outcome.settled_text.clone(),
            attempts: outcome.attempts.len(),
            flagged: !outcome.accepted,
            reason: outcome.final_rationale.clone(),
            generator_response: last.map(|a| a.generated_text.clone()).unwrap_or_default(),
            watchdog_response: last.map(|a| a.rationale.clone()).unwrap_or_default(),
            all_generator_responses: outcome.attempts.iter().map(|a| a.generated_text.clone()).collect(),
            all_watchdog_responses: outcome.attempts.iter().map(|a| a.rationale.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopEvent {
    GeneratorThinking {
        attempt: u32,
    },
    GeneratorResponseChunk {
        attempt: u32,
        chunk: String,
        accumulated: String,
    },
    GeneratorResponseDone {
        attempt: u32,
        response: String,
    },
    WatchdogAssessing {
        attempt: u32,
    },
    WatchdogResponseChunk {
        attempt: u32,
        chunk: String,
        accumulated: String,
    },
    WatchdogResponseDone {
        attempt: u32,
        response: String,
        safe: bool,
    },
    RevisionNeeded {
        attempt: u32,
        reason: String,
    },
    Complete(ChatReport),
    Failed(ChatReport),
}

impl LoopEvent {
    /// `complete` and `failed` end the sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopEvent::Complete(_) | LoopEvent::Failed(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            LoopEvent::GeneratorThinking { .. } => "generator_thinking",
            LoopEvent::GeneratorResponseChunk { .. } => "generator_response_chunk",
            LoopEvent::GeneratorResponseDone { .. } => "generator_response_done",
            LoopEvent::WatchdogAssessing { .. } => "watchdog_assessing",
            LoopEvent::WatchdogResponseChunk { .. } => "watchdog_response_chunk",
            LoopEvent::WatchdogResponseDone { .. } => "watchdog_response_done",
            LoopEvent::RevisionNeeded { .. } => "revision_needed",
            LoopEvent::Complete(_) => "complete",
            LoopEvent::Failed(_) => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_event_is_tagged_by_status() {
        let ev = LoopEvent::GeneratorResponseChunk {
            attempt: 1,
            chunk: "lo, ".into(),
            accumulated: "Hello, ".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["status"], "generator_response_chunk");
        assert_eq!(json["accumulated"], "Hello, ");
        assert_eq!(ev.status(), "generator_response_chunk");
    }

    #[test]
    fn terminal_event_flattens_report() {
        let ev = LoopEvent::Failed(ChatReport {
            response: "fallback".into(),
            attempts: 3,
            flagged: true,
            reason: "missed opportunities".into(),
            generator_response: String::new(),
            watchdog_response: String::new(),
            all_generator_responses: vec![],
            all_watchdog_responses: vec![],
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["attempts"], 3);
        assert_eq!(json["flagged"], true);
        assert!(ev.is_terminal());

        let back: LoopEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
