//! Composition root
//!
//! Builds every manager from one [`Config`], runs the background workers on a
//! shared shutdown token, and tears everything down in order.

use crate::backend::{InferenceBackend, OllamaBackend};
use crate::budget::{BpeEstimator, CompressionPolicy, ContextOptimizer, RatioEstimator, TokenBudgetManager, TokenEstimator};
use crate::config::{Config, EmbeddingProviderKind, EstimatorKind, SummarizerKind};
use crate::error::{CoreError, Result};
use crate::memory::{CachedEmbedder, EmbeddingProvider, HashEmbedder, MemoryManager, OllamaEmbedder};
use crate::model::ModelManager;
use crate::orchestrator::InferenceOrchestrator;
use crate::summarizer::{BackendSummarizer, Summarizer, TruncatingSummarizer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// All managers wired together
pub struct InferenceService {
    pub models: Arc<ModelManager>,
    pub budget: Arc<TokenBudgetManager>,
    pub memory: Arc<MemoryManager>,
    pub orchestrator: Arc<InferenceOrchestrator>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceService {
    /// Build against the Ollama backend named in `config.backend`
    pub fn connect(config: Config) -> Result<Self> {
        let ollama = Arc::new(OllamaBackend::new(config.backend.clone())?);
        let embedder: Arc<dyn EmbeddingProvider> = match config.memory.embedding_provider {
            EmbeddingProviderKind::Local => Arc::new(HashEmbedder::new(config.memory.embedding_dimensions)),
            EmbeddingProviderKind::Ollama => Arc::new(OllamaEmbedder::new(
                ollama.clone(),
                config.memory.embedding_model.clone(),
            )),
        };
        Self::build(config, ollama, embedder)
    }

    /// Build against any backend and embedding provider
    pub fn build(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let estimator: Arc<dyn TokenEstimator> = match config.budget.estimator {
            EstimatorKind::Ratio => Arc::new(RatioEstimator::with_builtin_profiles(
                config.budget.fallback_chars_per_token,
            )),
            EstimatorKind::Bpe => Arc::new(BpeEstimator::new().map_err(CoreError::Configuration)?),
        };

        let summarizer: Arc<dyn Summarizer> = match config.budget.summarizer {
            SummarizerKind::Truncate => Arc::new(TruncatingSummarizer::default()),
            SummarizerKind::Backend => {
                let model = config
                    .budget
                    .summarizer_model
                    .clone()
                    .or_else(|| config.models.first().map(|m| m.name.clone()))
                    .ok_or_else(|| {
                        CoreError::Configuration("backend summarizer needs a model".to_string())
                    })?;
                Arc::new(BackendSummarizer::new(
                    backend.clone(),
                    model,
                    config.backend.request_timeout(),
                ))
            }
        };

        let models = Arc::new(ModelManager::new(
            &config.models,
            &config.backend,
            &config.orchestrator,
            backend.clone(),
        ));

        let optimizer = ContextOptimizer::new(
            estimator.clone(),
            summarizer.clone(),
            CompressionPolicy {
                tail_fraction: config.budget.compression_tail_fraction,
                min_tail: config.budget.compression_min_tail,
            },
            config.budget.summary_cache_size,
        );
        let budget = Arc::new(TokenBudgetManager::new(config.budget.clone(), estimator, optimizer));

        let embedder = Arc::new(
            CachedEmbedder::new(embedder, config.memory.embedding_cache_size)
                .with_dimensions(config.memory.embedding_dimensions),
        );
        let memory = Arc::new(MemoryManager::new(config.memory.clone(), embedder, summarizer));

        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(InferenceOrchestrator::new(
            config.orchestrator.clone(),
            config.features.clone(),
            models.clone(),
            budget.clone(),
            memory.clone(),
            backend,
            shutdown.clone(),
        ));

        Ok(Self {
            models,
            budget,
            memory,
            orchestrator,
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Check the backend, load startup models, and spawn the background workers.
    ///
    /// Fails without spawning anything when the backend is unreachable.
    pub async fn start(&self) -> Result<()> {
        self.models.initialize().await?;

        let handles = vec![
            self.models.clone().spawn_reaper(self.shutdown.child_token()),
            self.budget.clone().spawn_reset_task(self.shutdown.child_token()),
            self.memory.clone().spawn_consolidation(self.shutdown.child_token()),
            self.memory.clone().spawn_cleanup(self.shutdown.child_token()),
        ];
        self.workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);

        info!("Inference service started");
        Ok(())
    }

    /// Cancel in-flight requests, stop the workers, and unload every model
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down inference service");
        self.orchestrator.shutdown(grace).await;

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Background workers did not stop within {:?}", grace);
        }

        self.models.shutdown().await;
        info!("Inference service stopped");
    }
}
