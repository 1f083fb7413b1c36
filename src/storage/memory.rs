//! In-Memory Storage
//!
//! Information Hiding:
//! - HashMap/Vec storage structures hidden from users
//! - Thread-safe access via RwLock hidden behind async interface
//! - Suitable for testing and ephemeral sessions

use super::{
    expiry_cutoff, keep_most_recent, newest_first, HistoryStorage, LogEntry, LogFilter,
    LogStorage,
};
use crate::core::message::{Message, SessionKey};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory history and log storage.
/// Data is lost when process terminates
pub struct InMemoryStorage {
    sessions: Arc<RwLock<HashMap<SessionKey, Vec<Message>>>>,
    logs: Arc<RwLock<Vec<LogEntry>>>,
    ttl: Option<Duration>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            logs: Arc::new(RwLock::new(Vec::new())),
            ttl: None,
        }
    }

    /// Expire remembered messages older than `ttl`.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStorage for InMemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let history = sessions.entry(message.key()).or_default();
        history.push(message.clone());
        tracing::debug!(
            "[InMemoryStorage] Saved {} message for '{}:{}' ({} total)",
            message.role,
            message.user_id,
            message.session_id,
            history.len()
        );
        Ok(())
    }

    async fn history(&self, key: &SessionKey, limit: Option<usize>) -> Result<Vec<Message>> {
        let cutoff = expiry_cutoff(self.ttl);
        let mut sessions = self.sessions.write().await;

        let history = match sessions.get_mut(key) {
            Some(history) => {
                if let Some(cutoff) = cutoff {
                    history.retain(|m| m.timestamp >= cutoff);
                }
                history.clone()
            }
            None => Vec::new(),
        };

        let history = keep_most_recent(history, limit);
        tracing::debug!(
            "[InMemoryStorage] Loaded {} messages for '{}'",
            history.len(),
            key
        );
        Ok(history)
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(key);
        tracing::debug!("[InMemoryStorage] Cleared session '{}'", key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LogStorage for InMemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        tracing::debug!(
            "[InMemoryStorage] Logged {} entry for '{}:{}'",
            entry.kind,
            entry.user_id,
            entry.session_id
        );
        self.logs.write().await.push(entry);
        Ok(())
    }

    async fn logs(&self, filter: &LogFilter, limit: usize) -> Result<Vec<LogEntry>> {
        let logs = self.logs.read().await;
        let matching: Vec<LogEntry> = logs.iter().filter(|e| filter.matches(e)).cloned().collect();
        Ok(newest_first(matching, limit))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Role;
    use crate::storage::LogKind;
    use serde_json::json;

    fn key(user: &str, session: &str) -> SessionKey {
        SessionKey::new(user, session)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = InMemoryStorage::new();
        let k = key("alice", "s1");

        storage.save(&Message::new(&k, Role::User, "Hello")).await.unwrap();
        storage
            .save(&Message::new(&k, Role::Assistant, "Hi there"))
            .await
            .unwrap();

        let loaded = HistoryStorage::history(&storage, &k, None).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content.as_text(), "Hello");
        assert_eq!(loaded[1].content.as_text(), "Hi there");
        assert!(loaded[0].timestamp <= loaded[1].timestamp);
    }

    #[tokio::test]
    async fn test_limit_keeps_most_recent() {
        let storage = InMemoryStorage::new();
        let k = key("alice", "s1");
        for text in ["t1", "t2", "t3"] {
            storage.save(&Message::new(&k, Role::User, text)).await.unwrap();
        }

        let loaded = HistoryStorage::history(&storage, &k, Some(2)).await.unwrap();
        let texts: Vec<String> = loaded.iter().map(|m| m.content.as_text()).collect();
        assert_eq!(texts, vec!["t2", "t3"]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let storage = InMemoryStorage::new();
        storage
            .save(&Message::new(&key("alice", "s1"), Role::User, "alice secret"))
            .await
            .unwrap();
        storage
            .save(&Message::new(&key("bob", "s1"), Role::User, "bob secret"))
            .await
            .unwrap();

        let bob = HistoryStorage::history(&storage, &key("bob", "s1"), None).await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].content.as_text(), "bob secret");

        let other = HistoryStorage::history(&storage, &key("alice", "s2"), None).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_clear_only_affects_one_session() {
        let storage = InMemoryStorage::new();
        storage.save(&Message::new(&key("a", "1"), Role::User, "x")).await.unwrap();
        storage.save(&Message::new(&key("a", "2"), Role::User, "y")).await.unwrap();

        storage.clear(&key("a", "1")).await.unwrap();

        assert!(HistoryStorage::history(&storage, &key("a", "1"), None).await.unwrap().is_empty());
        assert_eq!(HistoryStorage::history(&storage, &key("a", "2"), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_messages_are_dropped() {
        let storage = InMemoryStorage::new().with_ttl(Some(Duration::hours(1)));
        let k = key("alice", "s1");

        let mut old = Message::new(&k, Role::User, "ancient");
        old.timestamp = old.timestamp - Duration::hours(2);
        storage.save(&old).await.unwrap();
        storage.save(&Message::new(&k, Role::User, "fresh")).await.unwrap();

        let loaded = HistoryStorage::history(&storage, &k, None).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content.as_text(), "fresh");
    }

    #[tokio::test]
    async fn test_logs_newest_first_with_filter() {
        let storage = InMemoryStorage::new();
        storage.log_request("alice", "s1", json!({"n": 1}), "req-1").await.unwrap();
        storage
            .log_response("alice", "s1", json!({"n": 2}), Some("req-1"))
            .await
            .unwrap();
        storage.log_error("bob", "s9", json!({"n": 3})).await.unwrap();

        let filter = LogFilter {
            user_id: Some("alice".to_string()),
            ..LogFilter::default()
        };
        let logs = storage.logs(&filter, 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].kind, LogKind::Response);
        assert_eq!(logs[0].request_id.as_deref(), Some("req-1"));
        assert_eq!(logs[1].kind, LogKind::Request);

        let limited = storage.logs(&LogFilter::default(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
