//! Streaming Reporter: pushes loop progress to a live client through a bounded channel.
//!
//! Each fragment is forwarded as soon as the gateway yields it, together with the cumulative
//! text so far, so a client that missed events can resynchronise from any chunk. A failed
//! send means the client went away, and the loop is cancelled.

use tokio::sync::mpsc;

use crate::error::LoopError;
use crate::events::{ChatReport, LoopEvent};
use crate::gateway::FragmentStream;
use crate::safety_loop::LoopOutcome;

/// Which model a fragment stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Generator,
    Watchdog,
}

#[derive(Clone)]
pub struct StreamReporter {
    tx: mpsc::Sender<LoopEvent>,
}

impl StreamReporter {
    /// Reporter plus the receiving end for the transport, with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: LoopEvent) -> Result<(), LoopError> {
        self.tx.send(event).await.map_err(|_| LoopError::Cancelled)
    }

    /// Forward every fragment of `stream` in order; returns the full trimmed text.
    pub async fn relay(
        &self,
        phase: Phase,
        attempt: u32,
        mut stream: FragmentStream,
    ) -> Result<String, LoopError> {
        let mut accumulated = String::new();
        while let Some(fragment) = stream.recv().await {
            let chunk = fragment?;
            accumulated.push_str(&chunk);
            let event = match phase {
                Phase::Generator => LoopEvent::GeneratorResponseChunk {
                    attempt,
                    chunk,
                    accumulated: accumulated.clone(),
                },
                Phase::Watchdog => LoopEvent::WatchdogResponseChunk {
                    attempt,
                    chunk,
                    accumulated: accumulated.clone(),
                },
            };
            self.emit(event).await?;
        }
        Ok(accumulated.trim().to_string())
    }

    /// Terminal event for a settled loop: `complete` when accepted, `failed` otherwise.
    pub async fn settled(&self, outcome: &LoopOutcome) -> Result<(), LoopError> {
        let report = ChatReport::from(outcome);
        let event = if outcome.accepted {
            LoopEvent::Complete(report)
        } else {
            LoopEvent::Failed(report)
        };
        self.emit(event).await
    }
}
