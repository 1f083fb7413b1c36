//! SQLite Storage
//!
//! Information Hiding:
//! - Schema, SQL and JSON column encoding hidden behind both storage traits
//! - Blocking rusqlite calls moved onto tokio's blocking pool
//! - Connection lifecycle tied to `init` / `close`
//!
//! ```sql
//! CREATE TABLE messages (id, user_id, session_id, role, content, metadata, timestamp);
//! CREATE TABLE api_logs (id, user_id, session_id, log_type, payload, request_id, timestamp);
//! ```
//!
//! `content`, `metadata` and `payload` hold JSON text; timestamps are RFC 3339
//! UTC strings with a fixed width, so they order lexicographically.

use super::{expiry_cutoff, HistoryStorage, LogEntry, LogFilter, LogKind, LogStorage};
use crate::core::message::{Message, SessionKey};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    TEXT NOT NULL,
        session_id TEXT NOT NULL,
        role       TEXT NOT NULL,
        content    TEXT NOT NULL,
        metadata   TEXT NOT NULL,
        timestamp  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (user_id, session_id, id);
    CREATE TABLE IF NOT EXISTS api_logs (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    TEXT NOT NULL,
        session_id TEXT NOT NULL,
        log_type   TEXT NOT NULL,
        payload    TEXT NOT NULL,
        request_id TEXT,
        timestamp  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_api_logs_user ON api_logs (user_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_api_logs_session ON api_logs (session_id, timestamp);
";

/// SQLite-backed history and log storage.
pub struct SqliteStorage {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
    ttl: Option<Duration>,
}

impl SqliteStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    async fn open(&self) -> Result<()> {
        let path = self.path.clone();
        let conn = Arc::clone(&self.conn);
        let cutoff = expiry_cutoff(self.ttl).map(format_timestamp);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut slot = conn.lock();
            if slot.is_some() {
                return Ok(());
            }

            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }

            let db = Connection::open(&path)
                .context(format!("Failed to open SQLite database {:?}", path))?;
            db.execute_batch(SCHEMA).context("Failed to create schema")?;

            if let Some(cutoff) = cutoff {
                let purged = db.execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])?;
                if purged > 0 {
                    tracing::info!("[SqliteStorage] Purged {} expired messages", purged);
                }
            }

            *slot = Some(db);
            Ok(())
        })
        .await
        .context("SQLite task failed")??;

        tracing::info!("[SqliteStorage] Opened {:?}", self.path);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            conn.lock().take();
        })
        .await
        .context("SQLite task failed")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let db = guard
                .as_ref()
                .ok_or_else(|| anyhow!("SQLite storage used before init"))?;
            f(db)
        })
        .await
        .context("SQLite task failed")?
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .context(format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

#[async_trait]
impl HistoryStorage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        self.open().await
    }

    async fn save(&self, message: &Message) -> Result<()> {
        let row = (
            message.user_id.clone(),
            message.session_id.clone(),
            message.role.as_str().to_string(),
            serde_json::to_string(&message.content)?,
            serde_json::to_string(&message.metadata)?,
            format_timestamp(message.timestamp),
        );

        self.with_conn(move |db| {
            db.execute(
                "INSERT INTO messages (user_id, session_id, role, content, metadata, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.0, row.1, row.2, row.3, row.4, row.5],
            )
            .context("Failed to insert message")?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            "[SqliteStorage] Saved {} message for '{}:{}'",
            message.role,
            message.user_id,
            message.session_id
        );
        Ok(())
    }

    async fn history(&self, key: &SessionKey, limit: Option<usize>) -> Result<Vec<Message>> {
        let user_id = key.user_id.clone();
        let session_id = key.session_id.clone();
        let cutoff = expiry_cutoff(self.ttl).map(format_timestamp).unwrap_or_default();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let rows = self
            .with_conn(move |db| {
                let mut stmt = db.prepare(
                    "SELECT role, content, metadata, timestamp FROM (
                         SELECT id, role, content, metadata, timestamp FROM messages
                         WHERE user_id = ?1 AND session_id = ?2 AND timestamp >= ?3
                         ORDER BY id DESC LIMIT ?4
                     ) ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![user_id, session_id, cutoff, limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let messages = rows
            .into_iter()
            .map(|(role, content, metadata, timestamp)| {
                Ok(Message {
                    role: role.parse().map_err(|e: String| anyhow!(e))?,
                    content: serde_json::from_str(&content).context("Invalid message content")?,
                    timestamp: parse_timestamp(&timestamp)?,
                    user_id: key.user_id.clone(),
                    session_id: key.session_id.clone(),
                    metadata: serde_json::from_str(&metadata).context("Invalid message metadata")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!("[SqliteStorage] Loaded {} messages for '{}'", messages.len(), key);
        Ok(messages)
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        let user_id = key.user_id.clone();
        let session_id = key.session_id.clone();
        let deleted = self
            .with_conn(move |db| {
                Ok(db.execute(
                    "DELETE FROM messages WHERE user_id = ?1 AND session_id = ?2",
                    params![user_id, session_id],
                )?)
            })
            .await?;
        tracing::debug!("[SqliteStorage] Cleared {} messages for '{}'", deleted, key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl LogStorage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        self.open().await
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let timestamp = format_timestamp(entry.timestamp);

        self.with_conn(move |db| {
            db.execute(
                "INSERT INTO api_logs (user_id, session_id, log_type, payload, request_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.user_id,
                    entry.session_id,
                    entry.kind.as_str(),
                    payload,
                    entry.request_id,
                    timestamp
                ],
            )
            .context("Failed to insert log entry")?;
            Ok(())
        })
        .await
    }

    async fn logs(&self, filter: &LogFilter, limit: usize) -> Result<Vec<LogEntry>> {
        let user_id = filter.user_id.clone();
        let session_id = filter.session_id.clone();
        let start = filter.start.map(format_timestamp);
        let end = filter.end.map(format_timestamp);
        let limit = limit as i64;

        let rows = self
            .with_conn(move |db| {
                let mut stmt = db.prepare(
                    "SELECT user_id, session_id, log_type, payload, request_id, timestamp
                     FROM api_logs
                     WHERE (?1 IS NULL OR user_id = ?1)
                       AND (?2 IS NULL OR session_id = ?2)
                       AND (?3 IS NULL OR timestamp >= ?3)
                       AND (?4 IS NULL OR timestamp <= ?4)
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?5",
                )?;
                let rows = stmt
                    .query_map(params![user_id, session_id, start, end, limit], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(user_id, session_id, kind, payload, request_id, timestamp)| {
                Ok(LogEntry {
                    user_id,
                    session_id,
                    kind: kind.parse::<LogKind>()?,
                    payload: serde_json::from_str(&payload).context("Invalid log payload")?,
                    request_id,
                    timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}
