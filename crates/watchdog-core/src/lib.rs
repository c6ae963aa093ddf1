//! Watchdog core library.
//! A generator model answers the user; a second "watchdog" model assesses every candidate
//! for user-safety risk, and unsafe candidates are revised with the watchdog's feedback
//! until one is accepted or the attempt bound runs out.

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod mock;
pub mod reporter;
pub mod safety_loop;
pub mod verdict;
pub mod watchdog;

pub use config::{LlmMode, WatchdogConfig, DEFAULT_WATCHDOG_PROMPT};
pub use conversation::{Conversation, ConversationStore, Role, SessionGuard, Turn, DEFAULT_SESSION};
pub use error::{ConfigError, GatewayError, GatewayResult, LoopError, StoreError};
pub use events::{ChatReport, LoopEvent};
pub use gateway::{ChatCompletionsGateway, ChatMessage, FragmentStream, ModelGateway};
pub use mock::{MockGateway, MockReply};
pub use reporter::StreamReporter;
pub use safety_loop::{revision_prompt, Attempt, LoopOutcome, SafetyLoop, FALLBACK_RESPONSE};
pub use verdict::{Assessment, HeuristicClassifier, SafetyClassifier, Verdict};
pub use watchdog::Watchdog;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
