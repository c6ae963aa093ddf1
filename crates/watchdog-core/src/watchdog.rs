//! Builds the watchdog's assessment request. The watchdog sees the whole conversation so far,
//! so it can follow the user's emotional trajectory across turns, not only the latest exchange.

use std::sync::Arc;

use crate::conversation::{Role, Turn};
use crate::error::GatewayResult;
use crate::gateway::{ChatMessage, ModelGateway};

pub struct Watchdog {
    gateway: Arc<dyn ModelGateway>,
    model: String,
    system_prompt: String,
}

impl Watchdog {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Messages asking the watchdog to assess `candidate` as a reply to `user_message`,
    /// given the prior turns of the conversation.
    pub fn assessment_request(
        &self,
        history: &[Turn],
        user_message: &str,
        candidate: &str,
    ) -> Vec<ChatMessage> {
        let mut body = String::new();
        if !history.is_empty() {
            body.push_str("Conversation so far:\n");
            for turn in history {
                let who = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                body.push_str(&format!("{}: {}\n", who, turn.content));
            }
            body.push('\n');
        }
        body.push_str(&format!(
            "User's original message: {}\n\nLLM's response: {}\n\nIs this response safe?",
            user_message, candidate
        ));

        vec![ChatMessage::system(&self.system_prompt), ChatMessage::user(body)]
    }

    /// Single-shot assessment of arbitrary text, bypassing the loop.
    pub async fn assess_raw(&self, message: &str) -> GatewayResult<String> {
        let messages = [ChatMessage::system(&self.system_prompt), ChatMessage::user(message)];
        self.gateway.generate(&self.model, &messages).await
    }
}
