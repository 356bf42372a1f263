//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use inference_core::backend::{BackendError, BackendRequest, BackendResponse, BackendStream, InferenceBackend};
use inference_core::config::{Config, ModelConfig};
use inference_core::memory::HashEmbedder;
use inference_core::{InferenceService, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process backend with scripted output
pub struct MockBackend {
    pub delay: Duration,
    pub reply: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Pieces yielded by `generate_stream`, one every `chunk_interval`
    pub chunks: Vec<String>,
    pub chunk_interval: Duration,
    /// Fail `list_models` as an unreachable engine would
    pub offline: bool,
    pub warm_calls: AtomicUsize,
    pub generated_models: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            reply: "ok".to_string(),
            prompt_tokens: 30,
            completion_tokens: 20,
            chunks: vec!["Hello".to_string(), ", ".to_string(), "world".to_string()],
            chunk_interval: Duration::ZERO,
            offline: false,
            warm_calls: AtomicUsize::new(0),
            generated_models: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn warm_count(&self) -> usize {
        self.warm_calls.load(Ordering::SeqCst)
    }

    pub fn last_model(&self) -> Option<String> {
        self.generated_models.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        if self.offline {
            return Err(BackendError::RequestFailed("connection refused".to_string()));
        }
        Ok(vec!["chat-small".to_string(), "code-a".to_string(), "code-b".to_string()])
    }

    async fn warm(&self, _model: &str) -> Result<(), BackendError> {
        self.warm_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    async fn unload(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn generate(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        self.generated_models.lock().unwrap().push(request.model.clone());
        tokio::time::sleep(self.delay).await;
        Ok(BackendResponse {
            model: request.model,
            message: Some(Message::assistant(self.reply.clone())),
            done: true,
            done_reason: Some("stop".to_string()),
            prompt_eval_count: Some(self.prompt_tokens),
            eval_count: Some(self.completion_tokens),
            ..Default::default()
        })
    }

    async fn generate_stream(&self, request: BackendRequest) -> Result<BackendStream, BackendError> {
        self.generated_models.lock().unwrap().push(request.model.clone());
        let model = request.model;
        let interval = self.chunk_interval;
        let last = self.chunks.len().saturating_sub(1);
        let completion = self.completion_tokens;
        let items: Vec<(usize, String)> = self.chunks.iter().cloned().enumerate().collect();

        let stream = stream::iter(items).then(move |(i, piece)| {
            let model = model.clone();
            async move {
                tokio::time::sleep(interval).await;
                Ok(BackendResponse {
                    model,
                    message: Some(Message::assistant(piece)),
                    done: i == last,
                    eval_count: (i == last).then_some(completion),
                    ..Default::default()
                })
            }
        });
        Ok(stream.boxed())
    }
}

/// Config with a chat model and two code models, all loaded at startup
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.models = vec![
        ModelConfig::new("chat-small", "chat", 1),
        ModelConfig::new("code-a", "code", 1),
        ModelConfig::new("code-b", "code", 2),
    ];
    for model in &mut config.models {
        model.load_on_startup = true;
    }
    config
}

/// Started service over `backend`
pub async fn start_service(config: Config, backend: Arc<MockBackend>) -> InferenceService {
    let embedder = Arc::new(HashEmbedder::new(config.memory.embedding_dimensions));
    let service = InferenceService::build(config, backend, embedder).unwrap();
    service.start().await.unwrap();
    service
}
