//! Scripted in-process gateway for `llm_mode = "mock"` and for tests.
//!
//! Each model id has a queue of scripted replies; once the queue is empty the model's
//! fallback reply is used. Every call is recorded so tests can inspect what the loop sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{ChatMessage, FragmentStream, ModelGateway};

#[derive(Debug, Clone)]
pub enum MockReply {
    /// Streamed as exactly these fragments; `generate` returns their concatenation.
    Fragments(Vec<String>),
    /// The call fails as if the upstream API returned an error.
    Fail(String),
}

impl MockReply {
    /// A reply streamed word by word.
    pub fn text(text: &str) -> Self {
        MockReply::Fragments(text.split_inclusive(' ').map(str::to_string).collect())
    }

    pub fn fragments<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockReply::Fragments(parts.into_iter().map(Into::into).collect())
    }
}

#[derive(Default)]
pub struct MockGateway {
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallbacks: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

const DEFAULT_FALLBACK: &str = "I'm here to help. Could you tell me a little more about what's going on?";

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock used by the server in `mock` mode: the generator answers supportively, the
    /// watchdog approves.
    pub fn for_demo(generator_model: &str, watchdog_model: &str) -> Self {
        Self::new()
            .with_fallback(
                generator_model,
                "I'm really glad you reached out. You don't have to go through this alone; \
                 if you're in danger, please contact local emergency services or a crisis line.",
            )
            .with_fallback(
                watchdog_model,
                "The response recognises the user's state and points to support. ACCEPTABLE.",
            )
    }

    pub fn with_fallback(self, model: &str, reply: &str) -> Self {
        lock(&self.fallbacks).insert(model.to_string(), reply.to_string());
        self
    }

    /// Queue a scripted reply for `model`; replies are consumed in order.
    pub fn push(&self, model: &str, reply: MockReply) -> &Self {
        lock(&self.scripts)
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// All calls so far as `(model, messages)`.
    pub fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, model: &str) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls)
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, msgs)| msgs.clone())
            .collect()
    }

    fn next_reply(&self, model: &str, messages: &[ChatMessage]) -> MockReply {
        lock(&self.calls).push((model.to_string(), messages.to_vec()));
        if let Some(reply) = lock(&self.scripts).get_mut(model).and_then(VecDeque::pop_front) {
            return reply;
        }
        let fallback = lock(&self.fallbacks)
            .get(model)
            .cloned()
            .unwrap_or_else(|| DEFAULT_FALLBACK.to_string());
        MockReply::text(&fallback)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ModelGateway for MockGateway {
    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> GatewayResult<String> {
        match self.next_reply(model, messages) {
            MockReply::Fragments(parts) => Ok(parts.concat().trim().to_string()),
            MockReply::Fail(msg) => Err(GatewayError::Api { status: 503, body: msg }),
        }
    }

    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> GatewayResult<FragmentStream> {
        let parts = match self.next_reply(model, messages) {
            MockReply::Fragments(parts) => parts,
            MockReply::Fail(msg) => return Err(GatewayError::Api { status: 503, body: msg }),
        };
        let (tx, rx) = mpsc::channel(parts.len().max(1));
        tokio::spawn(async move {
            for part in parts {
                if tx.send(Ok(part)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
