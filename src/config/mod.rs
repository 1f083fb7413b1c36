mod settings;

pub use settings::{ApiConfig, CustomStorage, LogConfig, MemoryConfig, ModelConfig, Settings};
