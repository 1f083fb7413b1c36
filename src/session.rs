//! Chat Session - chainable request builder scoped to one (user, session) pair
//!
//! Information Hiding:
//! - Message assembly order (system, history, user turn) hidden behind ask/stream
//! - Correlation between request and response log entries handled internally
//! - Streaming accumulation and the include_usage capability probe are invisible to callers
//!
//! A session is reusable: every call takes `&self`, so one builder can drive
//! any number of turns.

use crate::client::QwenClient;
use crate::core::llm::{ChatCompletion, ChatRequest, ChunkStream, StreamOptions, Usage};
use crate::core::message::{ChatMessage, Message, MessageContent, Role, SessionKey};
use crate::error::{ApiError, Result};
use crate::multimodal;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Builder for chat exchanges on a single session.
#[derive(Clone)]
pub struct ChatSession {
    client: QwenClient,
    user_id: String,
    session_id: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_message: Option<String>,
    search_enabled: bool,
    memory_enabled: bool,
    history_limit: Option<usize>,
    extra: Map<String, Value>,
}

/// One in-flight exchange: the assembled request and its correlation id.
struct Turn {
    key: SessionKey,
    user_content: MessageContent,
    request: ChatRequest,
    request_id: String,
}

enum StreamState {
    Start(MessageContent),
    Receiving {
        turn: Turn,
        chunks: ChunkStream,
        full: String,
        usage: Option<Usage>,
    },
    Done,
}

fn web_search_tool() -> Value {
    json!({"type": "web_search", "web_search": {"enable": true}})
}

impl ChatSession {
    pub(crate) fn new(client: QwenClient, user_id: String, session_id: String) -> Self {
        let defaults = &client.settings().model;
        Self {
            model: defaults.default_model.clone(),
            temperature: defaults.default_temperature.clamp(0.0, 1.0),
            max_tokens: defaults.default_max_tokens.max(1),
            system_message: defaults.default_system_message.clone(),
            search_enabled: false,
            memory_enabled: client.memory().is_enabled(),
            history_limit: None,
            extra: Map::new(),
            user_id,
            session_id,
            client,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sampling temperature, clamped to `[0, 1]`.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = if temperature.is_nan() {
            0.0
        } else {
            temperature.clamp(0.0, 1.0)
        };
        self
    }

    /// Output token cap, at least 1.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn system(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    pub fn search(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    pub fn memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Override the configured history length for this session's requests.
    /// `0` sends no history at all.
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Extra provider parameter flattened into the request body (`top_p`, `seed`, ...).
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.session_id.clone())
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn current_temperature(&self) -> f32 {
        self.temperature
    }

    pub fn current_max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn is_search_enabled(&self) -> bool {
        self.search_enabled
    }

    pub fn is_memory_enabled(&self) -> bool {
        self.memory_enabled
    }

    /// Send one text turn and wait for the full completion.
    pub async fn ask(&self, message: &str) -> Result<ChatCompletion> {
        self.send(MessageContent::from(message)).await
    }

    /// Send one text turn and yield content fragments as they arrive.
    ///
    /// The turn is remembered and the response logged once the provider ends
    /// the stream. Dropping the stream before that discards the turn.
    pub fn stream(&self, message: &str) -> BoxStream<'_, Result<String>> {
        let start = StreamState::Start(MessageContent::from(message));

        stream::unfold(start, move |state| async move {
            let mut state = state;
            loop {
                match state {
                    StreamState::Start(content) => {
                        let mut turn = self.prepare(content, true).await;
                        match self.open_stream(&mut turn).await {
                            Ok(chunks) => {
                                state = StreamState::Receiving {
                                    turn,
                                    chunks,
                                    full: String::new(),
                                    usage: None,
                                };
                            }
                            Err(e) => {
                                self.log_failure(&turn, &e).await;
                                return Some((Err(e.into()), StreamState::Done));
                            }
                        }
                    }
                    StreamState::Receiving {
                        turn,
                        mut chunks,
                        mut full,
                        mut usage,
                    } => match chunks.next().await {
                        Some(Ok(chunk)) => {
                            let fragment = chunk
                                .content()
                                .filter(|c| !c.is_empty())
                                .map(str::to_string);
                            if chunk.usage.is_some() {
                                usage = chunk.usage;
                            }
                            if let Some(fragment) = &fragment {
                                full.push_str(fragment);
                            }

                            state = StreamState::Receiving {
                                turn,
                                chunks,
                                full,
                                usage,
                            };
                            if let Some(fragment) = fragment {
                                return Some((Ok(fragment), state));
                            }
                        }
                        Some(Err(e)) => {
                            self.log_failure(&turn, &e).await;
                            return Some((Err(e.into()), StreamState::Done));
                        }
                        None => {
                            self.finish_stream(&turn, &full, usage).await;
                            return None;
                        }
                    },
                    StreamState::Done => return None,
                }
            }
        })
        .boxed()
    }

    /// Ask about one image.
    pub async fn image(&self, message: &str, path: impl AsRef<Path>) -> Result<ChatCompletion> {
        let content = multimodal::image_content(message, &[path.as_ref()]).await?;
        self.send(content).await
    }

    /// Ask about a sequence of video frames, sent as images in order.
    pub async fn video<P: AsRef<Path>>(&self, message: &str, frames: &[P]) -> Result<ChatCompletion> {
        let content = multimodal::image_content(message, frames).await?;
        self.send(content).await
    }

    /// Ask about a UTF-8 text document inlined into the prompt.
    pub async fn document(&self, message: &str, path: impl AsRef<Path>) -> Result<ChatCompletion> {
        let prompt = multimodal::document_prompt(message, path.as_ref()).await?;
        self.ask(&prompt).await
    }

    /// Remembered messages for this session, oldest first.
    pub async fn history(&self, limit: Option<usize>) -> Vec<Message> {
        self.client
            .memory()
            .history(&self.key(), limit.or(self.history_limit))
            .await
    }

    pub async fn clear_memory(&self) -> bool {
        self.client.memory().clear(&self.key()).await
    }

    async fn send(&self, content: MessageContent) -> Result<ChatCompletion> {
        let turn = self.prepare(content, false).await;

        match self.client.llm().chat(&turn.request).await {
            Ok(completion) => {
                self.log_response(
                    &turn,
                    json!({
                        "choices": completion.choices,
                        "usage": completion.usage,
                        "model": completion.model,
                        "created": completion.created,
                    }),
                )
                .await;

                if let Some(reply) = completion.content().filter(|c| !c.is_empty()) {
                    self.remember(&turn, reply).await;
                } else {
                    tracing::debug!(
                        "[ChatSession] No assistant content for request {}, turn not remembered",
                        turn.request_id
                    );
                }
                Ok(completion)
            }
            Err(e) => {
                self.log_failure(&turn, &e).await;
                Err(e.into())
            }
        }
    }

    /// Assemble the request (system, history, user turn, tools) and log it.
    async fn prepare(&self, content: MessageContent, stream: bool) -> Turn {
        let key = self.key();
        let mut messages = Vec::new();

        if let Some(system) = &self.system_message {
            messages.push(ChatMessage::new(Role::System, system.as_str()));
        }

        if self.memory_enabled {
            let history = self.client.memory().history(&key, self.history_limit).await;
            messages.extend(history.iter().map(Message::to_chat_message));
        }

        messages.push(ChatMessage::new(Role::User, content.clone()));

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            tools: self.search_enabled.then(|| vec![web_search_tool()]),
            extra: self.extra.clone(),
        };

        let request_id = self
            .client
            .logs_manager()
            .log_request(&key.user_id, &key.session_id, &request, None)
            .await;

        tracing::debug!(
            "[ChatSession] Request {} for '{}' with {} messages",
            request_id,
            key,
            request.messages.len()
        );

        Turn {
            key,
            user_content: content,
            request,
            request_id,
        }
    }

    /// Open the stream, dropping `stream_options` once if the provider rejects it.
    async fn open_stream(&self, turn: &mut Turn) -> std::result::Result<ChunkStream, ApiError> {
        let first = self.client.llm().stream_chat(&turn.request).await;
        match first {
            Err(e) if e.rejects_parameter("stream_options") || e.rejects_parameter("include_usage") => {
                tracing::info!(
                    "[ChatSession] Provider rejected stream_options, retrying request {} without it",
                    turn.request_id
                );
                turn.request.stream_options = None;
                self.client.llm().stream_chat(&turn.request).await
            }
            other => other,
        }
    }

    async fn finish_stream(&self, turn: &Turn, full: &str, usage: Option<Usage>) {
        if !full.is_empty() {
            self.remember(turn, full).await;
        }
        self.log_response(
            turn,
            json!({"content": full, "usage": usage, "stream": true}),
        )
        .await;
    }

    /// Persist user then assistant message, when memory is on for this session.
    async fn remember(&self, turn: &Turn, reply: &str) {
        if !self.memory_enabled {
            return;
        }
        // Both messages carry the request id so they can be joined to the API log
        let mut metadata = Map::new();
        metadata.insert("request_id".to_string(), json!(turn.request_id));

        let memory = self.client.memory();
        memory
            .save(
                Message::new(&turn.key, Role::User, turn.user_content.clone())
                    .with_metadata(metadata.clone()),
            )
            .await;
        memory
            .save(Message::new(&turn.key, Role::Assistant, reply).with_metadata(metadata))
            .await;
    }

    async fn log_response(&self, turn: &Turn, payload: Value) {
        self.client
            .logs_manager()
            .log_response(
                &turn.key.user_id,
                &turn.key.session_id,
                payload,
                Some(&turn.request_id),
            )
            .await;
    }

    async fn log_failure(&self, turn: &Turn, error: &ApiError) {
        tracing::error!(
            "[ChatSession] Request {} for '{}' failed: {}",
            turn.request_id,
            turn.key,
            error
        );
        self.client
            .logs_manager()
            .log_error(
                &turn.key.user_id,
                &turn.key.session_id,
                json!({
                    "error_type": error.kind.name(),
                    "error_message": error.message,
                    "error_code": error.code,
                    "request_id": turn.request_id,
                    "request_params": turn.request,
                }),
            )
            .await;
    }
}
