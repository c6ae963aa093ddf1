//! Error types for the watchdog core.

use thiserror::Error;

/// Result type alias for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures talking to the external generation capability. Always fatal to the current loop.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model response parse failed: {0}")]
    Decode(String),

    #[error("no API key configured (set OPENAI_API_KEY or OPENROUTER_API_KEY)")]
    MissingApiKey,

    #[error("model stream failed: {0}")]
    Stream(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session '{0}' already has a request in flight")]
    SessionBusy(String),
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("session '{0}' already has a request in flight")]
    SessionBusy(String),

    #[error("client went away; loop cancelled")]
    Cancelled,
}

impl From<StoreError> for LoopError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionBusy(id) => LoopError::SessionBusy(id),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
