//! Safety-Gated Loop.
//!
//! ```text
//! Generating -> Classifying -> Accepted
//!                           -> Revising -> Generating      (attempt < N)
//!                           -> Exhausted                   (attempt == N)
//! ```
//!
//! The generator always receives a single-turn prompt: the raw user message first, then a
//! revision prompt embedding the watchdog's rationale verbatim. Multi-turn context goes to the
//! watchdog only. Gateway errors end the loop immediately; only Unsafe verdicts retry.

use std::sync::Arc;

use crate::config::WatchdogConfig;
use crate::conversation::{Conversation, ConversationStore, Turn};
use crate::error::LoopError;
use crate::events::LoopEvent;
use crate::gateway::{ChatMessage, ModelGateway};
use crate::reporter::{Phase, StreamReporter};
use crate::verdict::{HeuristicClassifier, SafetyClassifier, Verdict};
use crate::watchdog::Watchdog;

/// Returned to the user when every attempt was judged unsafe.
pub const FALLBACK_RESPONSE: &str = "Sorry, I couldn't provide a safe response to your request.";

/// One generate + classify cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub index: u32,
    pub generated_text: String,
    pub verdict: Verdict,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Accepted model output, or `FALLBACK_RESPONSE` when exhausted.
    pub settled_text: String,
    pub accepted: bool,
    pub attempts: Vec<Attempt>,
    /// Empty when accepted; the last watchdog rationale when exhausted.
    pub final_rationale: String,
}

/// Prompt for the next attempt after an Unsafe verdict.
pub fn revision_prompt(rationale: &str, user_message: &str) -> String {
    format!(
        "Your previous response was flagged by a safety watchdog as UNSAFE with the following assessment:\n\
         {rationale}\n\
         Please revise your answer to ensure it is SAFE according to the watchdog's criteria. \
         Address the concerns above. Original user message: {user_message}"
    )
}

pub struct SafetyLoop {
    gateway: Arc<dyn ModelGateway>,
    classifier: Arc<dyn SafetyClassifier>,
    watchdog: Watchdog,
    generator_model: String,
    max_attempts: u32,
}

impl SafetyLoop {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: &WatchdogConfig) -> Self {
        let watchdog = Watchdog::new(
            Arc::clone(&gateway),
            config.watchdog_model.clone(),
            config.watchdog_prompt.clone(),
        );
        Self {
            gateway,
            classifier: Arc::new(HeuristicClassifier::new()),
            watchdog,
            generator_model: config.generator_model.clone(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SafetyClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Take hold of `session_id` in `store` and run one loop against it.
    pub async fn converse(
        &self,
        store: &ConversationStore,
        session_id: &str,
        message: &str,
        reporter: Option<&StreamReporter>,
    ) -> Result<LoopOutcome, LoopError> {
        let mut session = store.acquire(session_id)?;
        self.run(&mut session, message, reporter).await
    }

    /// Run the loop for `message`. The user turn is appended on entry; exactly one assistant
    /// turn is appended when the loop settles, accepted or exhausted. With a reporter, both
    /// models are streamed and every transition is emitted as a `LoopEvent`.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        message: &str,
        reporter: Option<&StreamReporter>,
    ) -> Result<LoopOutcome, LoopError> {
        let history: Vec<Turn> = conversation.turns().to_vec();
        conversation.push_user(message);

        let mut prompt = message.to_string();
        let mut attempts: Vec<Attempt> = Vec::with_capacity(self.max_attempts as usize);

        for index in 1..=self.max_attempts {
            notify(reporter, LoopEvent::GeneratorThinking { attempt: index }).await?;
            let generated = self
                .complete(
                    Phase::Generator,
                    index,
                    &self.generator_model,
                    &[ChatMessage::user(prompt.as_str())],
                    reporter,
                )
                .await?;
            notify(
                reporter,
                LoopEvent::GeneratorResponseDone { attempt: index, response: generated.clone() },
            )
            .await?;

            notify(reporter, LoopEvent::WatchdogAssessing { attempt: index }).await?;
            let request = self.watchdog.assessment_request(&history, message, &generated);
            let watchdog_text = self
                .complete(Phase::Watchdog, index, self.watchdog.model(), &request, reporter)
                .await?;
            let assessment = self.classifier.assess(&watchdog_text);

            tracing::info!(
                target: "watchdog::loop",
                attempt = index,
                max_attempts = self.max_attempts,
                verdict = ?assessment.verdict,
                generated_len = generated.len(),
                rationale_len = assessment.rationale.len(),
                "attempt classified"
            );
            tracing::debug!(target: "watchdog::loop", attempt = index, generated = %generated, rationale = %assessment.rationale);

            notify(
                reporter,
                LoopEvent::WatchdogResponseDone {
                    attempt: index,
                    response: assessment.rationale.clone(),
                    safe: assessment.verdict.is_safe(),
                },
            )
            .await?;

            attempts.push(Attempt {
                index,
                generated_text: generated,
                verdict: assessment.verdict,
                rationale: assessment.rationale,
            });

            if assessment.verdict.is_safe() {
                return Ok(self.settle(conversation, attempts, true, reporter).await);
            }

            if index < self.max_attempts {
                let reason = attempts.last().map(|a| a.rationale.clone()).unwrap_or_default();
                prompt = revision_prompt(&reason, message);
                notify(reporter, LoopEvent::RevisionNeeded { attempt: index, reason }).await?;
            }
        }

        tracing::warn!(
            target: "watchdog::loop",
            attempts = attempts.len(),
            "all attempts judged unsafe; returning fallback"
        );
        Ok(self.settle(conversation, attempts, false, reporter).await)
    }

    async fn complete(
        &self,
        phase: Phase,
        attempt: u32,
        model: &str,
        messages: &[ChatMessage],
        reporter: Option<&StreamReporter>,
    ) -> Result<String, LoopError> {
        match reporter {
            None => Ok(self.gateway.generate(model, messages).await?),
            Some(reporter) => {
                let stream = self.gateway.generate_stream(model, messages).await?;
                reporter.relay(phase, attempt, stream).await
            }
        }
    }

    async fn settle(
        &self,
        conversation: &mut Conversation,
        attempts: Vec<Attempt>,
        accepted: bool,
        reporter: Option<&StreamReporter>,
    ) -> LoopOutcome {
        let last = attempts.last();
        // History keeps what the model actually said, even when the user gets the fallback.
        conversation.push_assistant(last.map(|a| a.generated_text.clone()).unwrap_or_default());

        let outcome = if accepted {
            LoopOutcome {
                settled_text: last.map(|a| a.generated_text.clone()).unwrap_or_default(),
                accepted: true,
                final_rationale: String::new(),
                attempts,
            }
        } else {
            LoopOutcome {
                settled_text: FALLBACK_RESPONSE.to_string(),
                accepted: false,
                final_rationale: last.map(|a| a.rationale.clone()).unwrap_or_default(),
                attempts,
            }
        };

        if let Some(reporter) = reporter {
            // The loop has settled; a client that left now only misses the summary.
            if reporter.settled(&outcome).await.is_err() {
                tracing::debug!(target: "watchdog::loop", "client gone before terminal event");
            }
        }
        outcome
    }
}

async fn notify(reporter: Option<&StreamReporter>, event: LoopEvent) -> Result<(), LoopError> {
    match reporter {
        Some(reporter) => reporter.emit(event).await,
        None => Ok(()),
    }
}
