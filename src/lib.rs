//! Inference core: model lifecycle, token budgets, long-term memory, and the
//! request pipeline that ties them to a local inference engine.

pub mod backend;
pub mod budget;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod summarizer;
pub mod telemetry;

pub use config::Config;
pub use error::{CoreError, Result};
pub use message::{Message, Role};
pub use orchestrator::{
    GenerationParams, InferenceOrchestrator, InferenceRequest, InferenceResult, InferenceStatus,
    RequestType, StreamChunk,
};
pub use service::InferenceService;
