//! Memory Manager - read-through / write-through history cache
//!
//! Information Hiding:
//! - Storage backend and local cache hidden behind three calls (save, history, clear)
//! - Storage failures degrade to empty results; they never reach the caller
//! - A manager without storage is a no-op, so callers never branch on "memory enabled"
//!
//! The cache always holds a session's complete history. The history limit is
//! applied when reading, so a warm entry answers requests with any limit.

use crate::config::MemoryConfig;
use crate::core::message::{Message, SessionKey};
use crate::error::Result;
use crate::storage::factory::create_history_storage;
use crate::storage::HistoryStorage;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CachedHistory {
    messages: Vec<Message>,
    loaded_at: Instant,
}

/// Bounded LRU cache whose entries also expire a fixed time after population.
struct HistoryCache {
    entries: Mutex<LruCache<SessionKey, CachedHistory>>,
    ttl: Duration,
}

impl HistoryCache {
    fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn get(&self, key: &SessionKey) -> Option<Vec<Message>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.loaded_at.elapsed() <= self.ttl => {
                return Some(entry.messages.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn put(&self, key: SessionKey, messages: Vec<Message>) {
        self.entries.lock().put(
            key,
            CachedHistory {
                messages,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Append to a resident entry only; returns whether the key was resident.
    fn append(&self, key: &SessionKey, message: Message) -> bool {
        match self.entries.lock().peek_mut(key) {
            Some(entry) => {
                entry.messages.push(message);
                true
            }
            None => false,
        }
    }

    fn evict(&self, key: &SessionKey) {
        self.entries.lock().pop(key);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct MemoryManager {
    storage: Option<Arc<dyn HistoryStorage>>,
    cache: Option<HistoryCache>,
    default_limit: Option<usize>,
}

impl MemoryManager {
    /// Build from configuration; fails only on an unusable storage tag.
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let storage = create_history_storage(config)?;
        Ok(Self::with_storage(storage, config))
    }

    pub fn with_storage(storage: Option<Arc<dyn HistoryStorage>>, config: &MemoryConfig) -> Self {
        let cache = match (storage.is_some() && config.cache_enabled, NonZeroUsize::new(config.cache_size)) {
            (true, Some(capacity)) => Some(HistoryCache::new(
                capacity,
                Duration::from_secs(config.cache_ttl_secs),
            )),
            _ => None,
        };

        Self {
            storage,
            cache,
            default_limit: (config.max_history_length > 0).then_some(config.max_history_length),
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
                tracing::warn!("[MemoryManager] Storage init failed: {:#}", e);
                false
            }
        }
    }

    /// Write through to storage; a resident cache entry is extended, a miss is left alone.
    pub async fn save(&self, message: Message) -> bool {
        let Some(storage) = &self.storage else {
            return true;
        };

        if let Err(e) = storage.save(&message).await {
            tracing::warn!(
                "[MemoryManager] Failed to save message for '{}:{}': {:#}",
                message.user_id,
                message.session_id,
                e
            );
            return false;
        }

        if let Some(cache) = &self.cache {
            let key = message.key();
            if cache.append(&key, message) {
                tracing::debug!("[MemoryManager] Appended to cached history for '{}'", key);
            }
        }
        true
    }

    /// Messages for a session, oldest first, bounded by `limit` or the configured default.
    pub async fn history(&self, key: &SessionKey, limit: Option<usize>) -> Vec<Message> {
        let Some(storage) = &self.storage else {
            return Vec::new();
        };
        let limit = limit.or(self.default_limit);

        let Some(cache) = &self.cache else {
            return match storage.history(key, limit).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!("[MemoryManager] Failed to load history for '{}': {:#}", key, e);
                    Vec::new()
                }
            };
        };

        if let Some(messages) = cache.get(key) {
            tracing::debug!("[MemoryManager] Cache hit for '{}'", key);
            return truncate(messages, limit);
        }

        match storage.history(key, None).await {
            Ok(messages) => {
                cache.put(key.clone(), messages.clone());
                truncate(messages, limit)
            }
            Err(e) => {
                tracing::warn!("[MemoryManager] Failed to load history for '{}': {:#}", key, e);
                Vec::new()
            }
        }
    }

    pub async fn clear(&self, key: &SessionKey) -> bool {
        let Some(storage) = &self.storage else {
            return true;
        };

        if let Some(cache) = &self.cache {
            cache.evict(key);
        }

        match storage.clear(key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[MemoryManager] Failed to clear history for '{}': {:#}", key, e);
                false
            }
        }
    }

    pub async fn close(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.close().await {
                tracing::warn!("[MemoryManager] Storage close failed: {:#}", e);
            }
        }
    }

    pub fn cached_sessions(&self) -> usize {
        self.cache.as_ref().map_or(0, HistoryCache::len)
    }
}

fn truncate(messages: Vec<Message>, limit: Option<usize>) -> Vec<Message> {
    crate::storage::keep_most_recent(messages, limit)
}
