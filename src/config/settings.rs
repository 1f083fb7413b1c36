use crate::error::{QwenError, Result};
use crate::storage::{HistoryStorage, LogStorage};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

const ENV_PREFIX: &str = "QWEN";
const API_KEY_VARS: [&str; 2] = ["QIANWEN_API_KEY", "DASHSCOPE_API_KEY"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiConfig,
    pub model: ModelConfig,
    pub memory: MemoryConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub default_system_message: Option<String>,
    pub available_models: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: "qwen-plus".to_string(),
            default_temperature: 0.7,
            default_max_tokens: 2000,
            default_system_message: None,
            available_models: ["qwen-plus", "qwen-max", "qwen-vl-plus", "qwen-vl-max"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// `memory`, `file`, `sqlite`, `mongodb`, `redis` or `custom`.
    pub storage_type: String,
    /// Messages included as context when the caller gives no limit. 0 = unbounded.
    pub max_history_length: usize,
    /// Storage-level expiry of remembered messages. 0 disables expiry.
    pub ttl_hours: u64,
    pub file_storage_path: String,
    pub sqlite_path: String,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    #[serde(skip)]
    pub custom_storage: Option<CustomStorage<dyn HistoryStorage>>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_type: "memory".to_string(),
            max_history_length: 10,
            ttl_hours: 24 * 7,
            file_storage_path: "./memory_data".to_string(),
            sqlite_path: "./qwenchat_memory.db".to_string(),
            cache_enabled: true,
            cache_size: 1000,
            cache_ttl_secs: 3600,
            custom_storage: None,
        }
    }
}

impl MemoryConfig {
    /// Register a caller-supplied history backend; it wins over `storage_type`.
    pub fn with_custom_storage(mut self, storage: Arc<dyn HistoryStorage>) -> Self {
        self.custom_storage = Some(CustomStorage(storage));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `memory`, `file`, `sqlite`, `mongodb` or `custom`.
    pub storage_type: String,
    /// Filter directive for the tracing subscriber installed by the binary.
    pub log_level: String,
    pub log_requests: bool,
    pub log_responses: bool,
    pub log_errors: bool,
    pub file_storage_path: String,
    pub sqlite_path: String,
    #[serde(skip)]
    pub custom_storage: Option<CustomStorage<dyn LogStorage>>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_type: "memory".to_string(),
            log_level: "info".to_string(),
            log_requests: true,
            log_responses: true,
            log_errors: true,
            file_storage_path: "./logs".to_string(),
            sqlite_path: "./qwenchat_logs.db".to_string(),
            custom_storage: None,
        }
    }
}

impl LogConfig {
    /// Register a caller-supplied log backend; it wins over `storage_type`.
    pub fn with_custom_storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.custom_storage = Some(CustomStorage(storage));
        self
    }
}

/// Slot for an injected storage implementation.
pub struct CustomStorage<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Clone for CustomStorage<T> {
    fn clone(&self) -> Self {
        CustomStorage(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> fmt::Debug for CustomStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomStorage(..)")
    }
}

impl Settings {
    /// Load `config/{CONFIG_ENV}` (default `config/default`), then `QWEN_*` variables.
    pub fn new() -> Result<Self> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());
        Self::build(File::with_name(&format!("config/{}", config_env)).required(false))
    }

    /// Load an explicit file (format picked from its extension), then `QWEN_*` variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(QwenError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::build(File::from(path))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        if settings.api.api_key.is_none() {
            settings.api.api_key = Self::api_key_from_env();
        }
        Ok(settings)
    }

    pub fn api_key_from_env() -> Option<String> {
        API_KEY_VARS
            .iter()
            .filter_map(|var| env::var(var).ok())
            .find(|key| !key.trim().is_empty())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api.api_key = Some(api_key.into());
        self
    }

    /// The configured API key; its absence is a startup error.
    pub fn api_key(&self) -> Result<&str> {
        self.api
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                QwenError::Configuration(
                    "API key not set: set QIANWEN_API_KEY or DASHSCOPE_API_KEY, or api.api_key in the config file"
                        .to_string(),
                )
            })
    }
}
