//! Managers composing storage with caching and per-kind policy.

pub mod logging;
pub mod memory;

pub use logging::LogManager;
pub use memory::MemoryManager;
