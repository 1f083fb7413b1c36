//! Storage Ports for conversation memory and API logs
//!
//! Information Hiding:
//! - Backend details (maps, files, SQLite, or caller-provided stores) hidden behind two traits
//! - Backends are selected by a configuration tag or injected directly (see `factory`)
//! - Storage errors stay inside this layer's `anyhow` results; managers decide how to degrade

use crate::core::message::{Message, SessionKey};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod factory;
pub mod filesystem;
pub mod memory;
pub mod sqlite;

/// Conversation history storage, partitioned by session key.
#[async_trait]
pub trait HistoryStorage: Send + Sync {
    /// Prepare the backend (open connections, create directories or tables).
    async fn init(&self) -> Result<()>;

    /// Append one message to its session.
    async fn save(&self, message: &Message) -> Result<()>;

    /// Messages for a session, oldest first.
    /// With a limit, only the most recent `limit` messages are returned.
    async fn history(&self, key: &SessionKey, limit: Option<usize>) -> Result<Vec<Message>>;

    /// Remove every message of exactly this session.
    async fn clear(&self, key: &SessionKey) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Request,
    Response,
    Error,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Request => "request",
            LogKind::Response => "response",
            LogKind::Error => "error",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(LogKind::Request),
            "response" => Ok(LogKind::Response),
            "error" => Ok(LogKind::Error),
            other => Err(anyhow::anyhow!("unknown log kind '{}'", other)),
        }
    }
}

/// One append-only API log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub user_id: String,
    pub session_id: String,
    pub kind: LogKind,
    pub payload: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        user_id: &str,
        session_id: &str,
        kind: LogKind,
        payload: Value,
        request_id: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            kind,
            payload,
            request_id,
            timestamp: Utc::now(),
        }
    }
}

/// Selection criteria for `LogStorage::logs`. Empty fields match everything;
/// time bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn for_session(key: &SessionKey) -> Self {
        Self {
            user_id: Some(key.user_id.clone()),
            session_id: Some(key.session_id.clone()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == entry.user_id)
            && self.session_id.as_ref().map_or(true, |s| *s == entry.session_id)
            && self.start.map_or(true, |start| entry.timestamp >= start)
            && self.end.map_or(true, |end| entry.timestamp <= end)
    }
}

/// Append-only API log storage.
#[async_trait]
pub trait LogStorage: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn append(&self, entry: LogEntry) -> Result<()>;

    /// Entries matching `filter`, newest first, at most `limit`.
    async fn logs(&self, filter: &LogFilter, limit: usize) -> Result<Vec<LogEntry>>;

    async fn close(&self) -> Result<()>;

    async fn log_request(
        &self,
        user_id: &str,
        session_id: &str,
        payload: Value,
        request_id: &str,
    ) -> Result<()> {
        self.append(LogEntry::new(
            user_id,
            session_id,
            LogKind::Request,
            payload,
            Some(request_id.to_string()),
        ))
        .await
    }

    async fn log_response(
        &self,
        user_id: &str,
        session_id: &str,
        payload: Value,
        request_id: Option<&str>,
    ) -> Result<()> {
        self.append(LogEntry::new(
            user_id,
            session_id,
            LogKind::Response,
            payload,
            request_id.map(str::to_string),
        ))
        .await
    }

    async fn log_error(&self, user_id: &str, session_id: &str, payload: Value) -> Result<()> {
        self.append(LogEntry::new(user_id, session_id, LogKind::Error, payload, None))
            .await
    }
}

/// Messages older than the TTL are treated as expired. `None` disables expiry,
/// as does a TTL reaching back past the earliest representable timestamp.
pub(crate) fn expiry_cutoff(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| Utc::now().checked_sub_signed(ttl))
}

/// Keep the most recent `limit` items of an oldest-first list.
pub(crate) fn keep_most_recent<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}

/// Newest first, truncated. Expects insertion order; ties keep the later entry first.
pub(crate) fn newest_first(mut entries: Vec<LogEntry>, limit: usize) -> Vec<LogEntry> {
    entries.reverse();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_cutoff_tolerates_huge_ttl() {
        assert!(expiry_cutoff(None).is_none());
        assert!(expiry_cutoff(Some(Duration::hours(1))).unwrap() < Utc::now());
        assert!(expiry_cutoff(Some(Duration::days(1_000_000_000))).is_none());
    }

    #[test]
    fn test_keep_most_recent() {
        assert_eq!(keep_most_recent(vec![1, 2, 3], Some(2)), vec![2, 3]);
        assert_eq!(keep_most_recent(vec![1, 2, 3], Some(5)), vec![1, 2, 3]);
        assert_eq!(keep_most_recent(vec![1, 2, 3], None), vec![1, 2, 3]);
        assert!(keep_most_recent(vec![1, 2, 3], Some(0)).is_empty());
    }

    #[test]
    fn test_filter_matches() {
        let entry = LogEntry::new("alice", "s1", LogKind::Request, json!({}), None);

        assert!(LogFilter::default().matches(&entry));
        assert!(LogFilter::for_session(&SessionKey::new("alice", "s1")).matches(&entry));
        assert!(!LogFilter::for_session(&SessionKey::new("alice", "s2")).matches(&entry));

        let future = LogFilter {
            start: Some(Utc::now() + Duration::hours(1)),
            ..LogFilter::default()
        };
        assert!(!future.matches(&entry));
    }
}
