//! File System Storage
//!
//! Information Hiding:
//! - File paths and JSON serialization format hidden from users
//! - Directory structure management hidden behind interface
//! - Persistence mechanism independent of storage trait users

use super::{
    expiry_cutoff, keep_most_recent, newest_first, HistoryStorage, LogEntry, LogFilter,
    LogStorage,
};
use crate::core::message::{Message, SessionKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File system history storage - each session is a JSON array
/// Files are stored as {base_path}/{user_id}/{session_id}.json
pub struct FileSystemStorage {
    base_path: PathBuf,
    ttl: Option<Duration>,
    write_lock: Mutex<()>,
}

impl FileSystemStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ttl: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.base_path
            .join(encode_component(&key.user_id))
            .join(format!("{}.json", encode_component(&key.session_id)))
    }

    async fn read_session(&self, path: &Path) -> Result<Vec<Message>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(path)
            .await
            .context(format!("Failed to read session file: {:?}", path))?;

        serde_json::from_str(&json).context("Failed to deserialize conversation history")
    }
}

#[async_trait]
impl HistoryStorage for FileSystemStorage {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .context("Failed to create storage directory")?;
        tracing::info!("[FileSystemStorage] Using {:?}", self.base_path);
        Ok(())
    }

    async fn save(&self, message: &Message) -> Result<()> {
        let path = self.session_path(&message.key());
        let _guard = self.write_lock.lock().await;

        let mut history = self.read_session(&path).await?;
        history.push(message.clone());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create user directory")?;
        }

        let json = serde_json::to_string_pretty(&history)
            .context("Failed to serialize conversation history")?;
        fs::write(&path, json)
            .await
            .context(format!("Failed to write session file: {:?}", path))?;

        tracing::debug!(
            "[FileSystemStorage] Saved message #{} for session '{}' to {:?}",
            history.len(),
            message.session_id,
            path
        );
        Ok(())
    }

    async fn history(&self, key: &SessionKey, limit: Option<usize>) -> Result<Vec<Message>> {
        let path = self.session_path(key);
        let mut history = self.read_session(&path).await?;

        if let Some(cutoff) = expiry_cutoff(self.ttl) {
            history.retain(|m| m.timestamp >= cutoff);
        }

        let history = keep_most_recent(history, limit);
        tracing::debug!(
            "[FileSystemStorage] Loaded {} messages for '{}' from {:?}",
            history.len(),
            key,
            path
        );
        Ok(history)
    }

    async fn clear(&self, key: &SessionKey) -> Result<()> {
        let path = self.session_path(key);
        let _guard = self.write_lock.lock().await;

        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .context(format!("Failed to delete session file: {:?}", path))?;
            tracing::debug!("[FileSystemStorage] Deleted session '{}' at {:?}", key, path);
        } else {
            tracing::debug!("[FileSystemStorage] Session '{}' does not exist, nothing to delete", key);
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// File log storage - JSON lines, one file per kind and day
/// Files are stored as {base_path}/{kind}_{YYYYMMDD}.jsonl
pub struct FileLogStorage {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLogStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn log_path(&self, entry: &LogEntry) -> PathBuf {
        self.base_path.join(format!(
            "{}_{}.jsonl",
            entry.kind,
            entry.timestamp.format("%Y%m%d")
        ))
    }
}

#[async_trait]
impl LogStorage for FileLogStorage {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .context("Failed to create log directory")?;
        Ok(())
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        let path = self.log_path(&entry);
        let mut line = serde_json::to_string(&entry).context("Failed to serialize log entry")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(format!("Failed to open log file: {:?}", path))?;
        file.write_all(line.as_bytes())
            .await
            .context(format!("Failed to append to log file: {:?}", path))?;
        file.flush().await?;
        Ok(())
    }

    async fn logs(&self, filter: &LogFilter, limit: usize) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e).context("Failed to read log directory"),
        };

        while let Some(file) = dir
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            let path = file.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            let contents = fs::read_to_string(&path)
                .await
                .context(format!("Failed to read log file: {:?}", path))?;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) if filter.matches(&entry) => entries.push(entry),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("[FileLogStorage] Skipping malformed line in {:?}: {}", path, e)
                    }
                }
            }
        }

        entries.sort_by_key(|e| e.timestamp);
        tracing::debug!("[FileLogStorage] {} entries matched", entries.len());
        Ok(newest_first(entries, limit))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Injective, filesystem-safe encoding of an identifier.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("_{:02x}", other)),
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
