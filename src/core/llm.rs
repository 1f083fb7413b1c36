use crate::config::ApiConfig;
use crate::core::message::ChatMessage;
use crate::core::sse::{SseDecoder, SseEvent};
use crate::error::{ApiError, ApiErrorKind, QwenError};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::time::Duration;

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Additional provider parameters (`top_p`, `seed`, ...) flattened into the body.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    /// Content of the first choice, if the provider returned any.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: AssistantMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Error object the provider may send in place of a delta.
    #[serde(default)]
    pub error: Option<Value>,
}

impl StreamChunk {
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, ApiError>>;

/// HTTP transport for an OpenAI-compatible chat completions endpoint.
pub struct LLMClient {
    client: Client,
    api_key: String,
    endpoint: String,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl LLMClient {
    pub fn new(api_key: String, config: &ApiConfig) -> Result<Self, QwenError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QwenError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatCompletion, ApiError> {
        let response = self.send(request).await?;
        response.json::<ChatCompletion>().await.map_err(|e| {
            ApiError::new(ApiErrorKind::Decode, format!("Response decode error: {}", e))
                .with_source(e)
        })
    }

    /// Open a streamed completion. Chunks are decoded lazily as the caller polls.
    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, ApiError> {
        let response = self.send(request).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        let state = ChunkReader {
            bytes,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return match event {
                        SseEvent::Done => None,
                        SseEvent::Data(json) => {
                            let chunk = decode_chunk(&json);
                            if chunk.is_err() {
                                // Nothing after a failed frame is delivered
                                state.finished = true;
                                state.pending.clear();
                            }
                            Some((chunk, state))
                        }
                    };
                }

                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(bytes)) => {
                        let events = state.decoder.feed(&bytes);
                        state.pending.extend(events);
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(ApiError::from(e)), state));
                    }
                    None => {
                        state.finished = true;
                        if let Some(event) = state.decoder.finish() {
                            state.pending.push_back(event);
                        }
                    }
                }
            }
        })
        .boxed())
    }

    /// Send with retries on connection failures, 429 and 5xx.
    async fn send(&self, request: &ChatRequest) -> Result<reqwest::Response, ApiError> {
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = backoff_delay(self.retry_delay_ms, attempt);
                tracing::warn!(
                    "[LLMClient] Retrying API call (attempt {}/{}) after {}ms delay",
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let result = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await;

            let error = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    let (message, code) = parse_provider_error(&body);
                    tracing::warn!("[LLMClient] API returned error status {}: {}", status, message);
                    ApiError::new(ApiErrorKind::Status(status), message).with_code(code)
                }
                Err(e) => {
                    tracing::warn!("[LLMClient] HTTP request failed: {}", e);
                    ApiError::from(e)
                }
            };

            if !error.is_retryable() || attempt >= self.max_retries {
                return Err(error);
            }
            attempt += 1;
        }
    }
}

struct ChunkReader {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

/// `base * 2^(attempt-1)`, saturating at `u64::MAX`.
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Decode one SSE data payload. An `error` object in the frame becomes an [`ApiError`].
fn decode_chunk(json: &str) -> Result<StreamChunk, ApiError> {
    let chunk = serde_json::from_str::<StreamChunk>(json).map_err(|e| {
        ApiError::new(ApiErrorKind::Decode, format!("Stream chunk decode error: {}", e))
            .with_source(e)
    })?;

    if chunk.error.is_some() {
        let (message, code) = parse_provider_error(json);
        tracing::warn!("[LLMClient] Provider error inside stream: {}", message);
        return Err(ApiError::new(ApiErrorKind::Provider, message).with_code(code));
    }
    Ok(chunk)
}

/// Pull `(message, code)` out of an OpenAI-style or DashScope-style error body.
fn parse_provider_error(body: &str) -> (String, Option<String>) {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return (body.to_string(), None),
    };

    let scope = value.get("error").filter(|e| e.is_object()).unwrap_or(&value);
    let message = scope
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    let code = scope.get("code").and_then(|c| match c {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    (message, code)
}
