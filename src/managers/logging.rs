//! Log Manager - API call audit trail
//!
//! Information Hiding:
//! - Log storage backend hidden behind request / response / error calls
//! - Per-kind enable flags applied here, not by callers
//! - Write failures are reported through tracing and never interrupt a chat call

use crate::config::LogConfig;
use crate::core::llm::ChatRequest;
use crate::error::Result;
use crate::storage::factory::create_log_storage;
use crate::storage::{LogEntry, LogFilter, LogStorage};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct LogManager {
    storage: Option<Arc<dyn LogStorage>>,
    log_requests: bool,
    log_responses: bool,
    log_errors: bool,
}

impl LogManager {
    pub fn new(config: &LogConfig) -> Result<Self> {
        let storage = create_log_storage(config)?;
        Ok(Self::with_storage(storage, config))
    }

    pub fn with_storage(storage: Option<Arc<dyn LogStorage>>, config: &LogConfig) -> Self {
        Self {
            storage,
            log_requests: config.log_requests,
            log_responses: config.log_responses,
            log_errors: config.log_errors,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub async fn init(&self) -> bool {
        let Some(storage) = &self.storage else {
            return true;
        };
        match storage.init().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[LogManager] Log storage init failed: {:#}", e);
                false
            }
        }
    }

    /// Record an outgoing request and return its correlation id.
    /// A fresh id is generated when none is given, even if nothing is written.
    pub async fn log_request(
        &self,
        user_id: &str,
        session_id: &str,
        request: &ChatRequest,
        request_id: Option<String>,
    ) -> String {
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let (Some(storage), true) = (&self.storage, self.log_requests) {
            let payload = json!({
                "request_id": request_id,
                "model": request.model,
                "messages": request.messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "stream": request.stream,
            });
            if let Err(e) = storage
                .log_request(user_id, session_id, payload, &request_id)
                .await
            {
                tracing::warn!("[LogManager] Failed to log request {}: {:#}", request_id, e);
            }
        }

        request_id
    }

    pub async fn log_response(
        &self,
        user_id: &str,
        session_id: &str,
        payload: Value,
        request_id: Option<&str>,
    ) {
        let (Some(storage), true) = (&self.storage, self.log_responses) else {
            return;
        };
        if let Err(e) = storage
            .log_response(user_id, session_id, payload, request_id)
            .await
        {
            tracing::warn!("[LogManager] Failed to log response: {:#}", e);
        }
    }

    pub async fn log_error(&self, user_id: &str, session_id: &str, payload: Value) {
        let (Some(storage), true) = (&self.storage, self.log_errors) else {
            return;
        };
        if let Err(e) = storage.log_error(user_id, session_id, payload).await {
            tracing::warn!("[LogManager] Failed to log error: {:#}", e);
        }
    }

    pub async fn logs(&self, filter: &LogFilter, limit: usize) -> Vec<LogEntry> {
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        match storage.logs(filter, limit).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("[LogManager] Failed to query logs: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.close().await {
                tracing::warn!("[LogManager] Log storage close failed: {:#}", e);
            }
        }
    }
}
