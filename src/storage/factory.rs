//! Storage selection by configuration tag, with an injected override slot
//! checked before the tag dispatch.

use super::filesystem::{FileLogStorage, FileSystemStorage};
use super::memory::InMemoryStorage;
use super::sqlite::SqliteStorage;
use super::{HistoryStorage, LogStorage};
use crate::config::{LogConfig, MemoryConfig};
use crate::error::{QwenError, Result};
use chrono::Duration;
use std::str::FromStr;
use std::sync::Arc;

/// Storage backends recognised by the `storage_type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    File,
    Sqlite,
    MongoDb,
    Redis,
    Custom,
}

impl FromStr for StorageKind {
    type Err = QwenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(StorageKind::Memory),
            "file" | "filesystem" => Ok(StorageKind::File),
            "sqlite" => Ok(StorageKind::Sqlite),
            "mongodb" | "mongo" => Ok(StorageKind::MongoDb),
            "redis" => Ok(StorageKind::Redis),
            "custom" => Ok(StorageKind::Custom),
            other => Err(QwenError::Configuration(format!(
                "Unknown storage type '{}'",
                other
            ))),
        }
    }
}

/// `0` disables expiry. Hours that do not fit a `chrono::Duration` are rejected.
fn ttl_from_hours(hours: u64) -> Result<Option<Duration>> {
    if hours == 0 {
        return Ok(None);
    }
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .map(Some)
        .ok_or_else(|| QwenError::Configuration(format!("ttl_hours {} is out of range", hours)))
}

/// History storage for `config`, or `None` when memory is disabled.
pub fn create_history_storage(config: &MemoryConfig) -> Result<Option<Arc<dyn HistoryStorage>>> {
    if !config.enabled {
        return Ok(None);
    }

    if let Some(custom) = &config.custom_storage {
        tracing::debug!("[StorageFactory] Using custom history storage");
        return Ok(Some(Arc::clone(&custom.0)));
    }

    let ttl = ttl_from_hours(config.ttl_hours)?;
    let storage: Arc<dyn HistoryStorage> = match config.storage_type.parse::<StorageKind>()? {
        StorageKind::Memory => Arc::new(InMemoryStorage::new().with_ttl(ttl)),
        StorageKind::File => {
            Arc::new(FileSystemStorage::new(&config.file_storage_path).with_ttl(ttl))
        }
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.sqlite_path).with_ttl(ttl)),
        StorageKind::MongoDb | StorageKind::Redis | StorageKind::Custom => {
            return Err(QwenError::UnsupportedStorageKind(config.storage_type.clone()))
        }
    };

    tracing::debug!("[StorageFactory] Using '{}' history storage", config.storage_type);
    Ok(Some(storage))
}

/// Log storage for `config`, or `None` when logging is disabled.
pub fn create_log_storage(config: &LogConfig) -> Result<Option<Arc<dyn LogStorage>>> {
    if !config.enabled {
        return Ok(None);
    }

    if let Some(custom) = &config.custom_storage {
        tracing::debug!("[StorageFactory] Using custom log storage");
        return Ok(Some(Arc::clone(&custom.0)));
    }

    let storage: Arc<dyn LogStorage> = match config.storage_type.parse::<StorageKind>()? {
        StorageKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageKind::File => Arc::new(FileLogStorage::new(&config.file_storage_path)),
        StorageKind::Sqlite => Arc::new(SqliteStorage::new(&config.sqlite_path)),
        StorageKind::MongoDb | StorageKind::Redis | StorageKind::Custom => {
            return Err(QwenError::UnsupportedStorageKind(config.storage_type.clone()))
        }
    };

    tracing::debug!("[StorageFactory] Using '{}' log storage", config.storage_type);
    Ok(Some(storage))
}
