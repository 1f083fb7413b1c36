//! Qwenchat - chat client for Qwen models on DashScope's OpenAI-compatible API
//!
//! This library provides a chainable session builder over the chat completions
//! endpoint, with pluggable conversation memory and API call logging.

pub mod cli;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod managers;
pub mod multimodal;
pub mod session;
pub mod storage;
pub mod utils;

pub use client::QwenClient;
pub use config::Settings;
pub use core::llm::{ChatCompletion, Usage};
pub use core::message::{ContentPart, Message, MessageContent, Role, SessionKey};
pub use error::{ApiError, ApiErrorKind, QwenError, Result};
pub use session::ChatSession;
pub use storage::{HistoryStorage, LogEntry, LogFilter, LogKind, LogStorage};
