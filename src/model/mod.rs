//! Model lifecycle: loading, eviction, and selection

pub mod manager;
pub mod types;

pub use manager::{ModelManager, DEFAULT_CONTEXT_WINDOW};
pub use types::{ModelRecord, ModelStatus, ModelUsageStats};
