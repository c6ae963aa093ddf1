//! Model Gateway: sends an ordered message sequence to a generation capability and returns
//! text, either whole or as a stream of fragments. No retry or safety logic lives here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{api_key_from_env, WatchdogConfig};
use crate::error::{GatewayError, GatewayResult};

/// Fragments of one streamed generation, in order. Finite and not restartable.
pub type FragmentStream = mpsc::Receiver<GatewayResult<String>>;

const STREAM_CHANNEL_CAPACITY: usize = 100;

/// One message of the sequence sent to a model (OpenAI-compatible shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Blocking generation: the full reply text.
    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> GatewayResult<String>;

    /// Incremental generation. Dropping the receiver stops the underlying read.
    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> GatewayResult<FragmentStream>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Streaming chunk (SSE `data:` payload).
#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Gateway for any OpenAI-compatible `/chat/completions` endpoint (OpenAI, OpenRouter, ...).
pub struct ChatCompletionsGateway {
    api_url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatCompletionsGateway {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, temperature: f32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_url: api_url.into(),
            api_key: api_key.into().trim().to_string(),
            temperature,
            client,
        }
    }

    /// Build from config; the key comes from the environment.
    pub fn from_config(config: &WatchdogConfig) -> GatewayResult<Self> {
        let key = api_key_from_env().ok_or(GatewayError::MissingApiKey)?;
        Ok(Self::new(config.api_url.clone(), key, config.temperature))
    }

    async fn send(
        &self,
        model: &str,
        messages: &[ChatMessage],
        stream: bool,
    ) -> GatewayResult<reqwest::Response> {
        let body = ChatRequest {
            model,
            messages,
            temperature: self.temperature,
            stream: stream.then_some(true),
        };
        let res = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::error!(
                target: "watchdog::gateway",
                status = %status,
                model,
                "model API returned HTTP {}",
                status
            );
            return Err(GatewayError::Api { status: status.as_u16(), body });
        }
        Ok(res)
    }
}

#[async_trait]
impl ModelGateway for ChatCompletionsGateway {
    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> GatewayResult<String> {
        let res = self.send(model, messages, false).await?;
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GatewayError::Decode("response has no choices[0].message.content".into()))?;
        Ok(content.trim().to_string())
    }

    async fn generate_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> GatewayResult<FragmentStream> {
        let res = self.send(model, messages, true).await?;
        tracing::debug!(target: "watchdog::gateway", model, "SSE stream established");

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let model = model.to_string();
        tokio::spawn(async move {
            use futures_util::TryStreamExt;
            let mut bytes = res.bytes_stream();
            let mut decoder = SseDecoder::default();
            loop {
                let chunk = match bytes.try_next().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(GatewayError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                for item in decoder.push(&chunk) {
                    match item {
                        SseItem::Fragment(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                // receiver dropped: caller cancelled
                                return;
                            }
                        }
                        SseItem::Done => {
                            tracing::debug!(target: "watchdog::gateway", model = %model, "stream completed");
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseItem {
    Fragment(String),
    Done,
}

/// Splits an SSE byte stream into content fragments. Lines (and multi-byte characters) can
/// straddle chunk boundaries, so bytes are buffered until a full line is available.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                out.push(SseItem::Done);
                break;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(content) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                        if !content.is_empty() {
                            out.push(SseItem::Fragment(content));
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(target: "watchdog::gateway", "skipping SSE chunk: {} - data: {}", e, data);
                }
            }
        }
        out
    }
}
