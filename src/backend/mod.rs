//! Backend inference engine abstraction
//!
//! The core talks to the engine that actually executes models through the
//! [`InferenceBackend`] trait. [`OllamaBackend`] speaks the Ollama HTTP API;
//! tests substitute in-process fakes.

pub mod circuit_breaker;
pub mod models;
pub mod ollama;

pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig};
pub use models::{BackendRequest, BackendResponse};
pub use ollama::OllamaBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Incremental backend output, terminated by an item with `done = true`
pub type BackendStream = BoxStream<'static, Result<BackendResponse, BackendError>>;

/// Backend engine error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl BackendError {
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else {
            BackendError::RequestFailed(e.to_string())
        }
    }
}

/// Engine that loads and executes models
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Names of the models the engine can serve; fails when it is unreachable
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    /// Make a model resident so later calls do not pay the load cost
    async fn warm(&self, model: &str) -> Result<(), BackendError>;

    /// Ask the engine to release a model's resources
    async fn unload(&self, model: &str) -> Result<(), BackendError>;

    /// Run a generation to completion
    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError>;

    /// Run a generation and yield partial responses in backend order
    async fn generate_stream(&self, request: BackendRequest) -> Result<BackendStream, BackendError>;
}
