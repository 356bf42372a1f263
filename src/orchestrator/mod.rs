//! Request pipeline: admission, routing, recall, generation, and tracking

pub mod manager;
pub mod models;
pub mod tasks;

pub use manager::{InferenceOrchestrator, InferenceStream};
pub use models::{
    GenerationParams, InferenceRequest, InferenceResult, InferenceSnapshot, InferenceStatus,
    PerformanceStats, RequestType, StreamChunk, TokenUsage,
};
pub use tasks::TaskPool;
