//! Qwen Client - owns configuration, transport and managers
//!
//! Information Hiding:
//! - Transport construction and storage selection hidden behind `new`
//! - Managers are always present; disabled ones are no-ops, so sessions never branch on them
//! - Lifetime pairing (`connect` / `close`) packaged as `scoped`

use crate::config::Settings;
use crate::core::llm::LLMClient;
use crate::error::Result;
use crate::managers::{LogManager, MemoryManager};
use crate::session::ChatSession;
use crate::storage::{LogEntry, LogFilter};
use chrono::Local;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_USER_ID: &str = "default_user";

struct ClientInner {
    settings: Settings,
    llm: LLMClient,
    memory: MemoryManager,
    logs: LogManager,
    closed: AtomicBool,
}

/// Handle to a configured chat client. Cloning shares the same transport and managers.
#[derive(Clone)]
pub struct QwenClient {
    inner: Arc<ClientInner>,
}

impl QwenClient {
    /// Build the client. Missing credentials and unusable storage tags fail here.
    pub fn new(settings: Settings) -> Result<Self> {
        let api_key = settings.api_key()?.to_string();
        let llm = LLMClient::new(api_key, &settings.api)?;
        let memory = MemoryManager::new(&settings.memory)?;
        let logs = LogManager::new(&settings.log)?;

        tracing::info!(
            "[QwenClient] Created for {} (memory: {}, logs: {})",
            llm.endpoint(),
            if memory.is_enabled() { settings.memory.storage_type.as_str() } else { "off" },
            if logs.is_enabled() { settings.log.storage_type.as_str() } else { "off" },
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                settings,
                llm,
                memory,
                logs,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// `new` followed by `initialize`.
    pub async fn connect(settings: Settings) -> Result<Self> {
        let client = Self::new(settings)?;
        client.initialize().await;
        Ok(client)
    }

    /// Initialize storage backends. A failed backend is logged and then degrades.
    pub async fn initialize(&self) {
        if !self.inner.memory.init().await {
            tracing::warn!("[QwenClient] Memory storage unavailable, history will appear empty");
        }
        if !self.inner.logs.init().await {
            tracing::warn!("[QwenClient] Log storage unavailable, API logging skipped");
        }
    }

    /// Run `f` with a connected client and close it afterwards, whatever `f` returns.
    pub async fn scoped<F, Fut, T>(settings: Settings, f: F) -> Result<T>
    where
        F: FnOnce(QwenClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = Self::connect(settings).await?;
        let result = f(client.clone()).await;
        client.close().await;
        result
    }

    /// New session builder. Omitted ids default to `default_user` and a fresh session id.
    pub fn chat(&self, user_id: Option<&str>, session_id: Option<&str>) -> ChatSession {
        let user_id = user_id.unwrap_or(DEFAULT_USER_ID).to_string();
        let session_id = session_id.map_or_else(generate_session_id, str::to_string);
        ChatSession::new(self.clone(), user_id, session_id)
    }

    /// Configured model catalogue.
    pub fn models(&self) -> &[String] {
        &self.inner.settings.model.available_models
    }

    /// Stored API log entries, newest first.
    pub async fn logs(&self, filter: &LogFilter, limit: usize) -> Vec<LogEntry> {
        self.inner.logs.logs(filter, limit).await
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Release storage backends. Later calls are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.memory.close().await;
        self.inner.logs.close().await;
        tracing::info!("[QwenClient] Closed");
    }

    pub(crate) fn llm(&self) -> &LLMClient {
        &self.inner.llm
    }

    pub(crate) fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub(crate) fn logs_manager(&self) -> &LogManager {
        &self.inner.logs
    }
}

/// `session_{YYYYMMDD_HHMMSS}_{8 hex}`; the random suffix keeps same-second ids apart.
fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "session_{}_{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}
