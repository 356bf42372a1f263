//! Model lifecycle manager
//!
//! Tracks which models are resident in the backend, loads them on demand,
//! evicts idle ones, and picks the best loaded model for a task family.
//! A model name has at most one record; its status moves
//! `loading -> loaded | error` and `loaded -> unloading -> removed`.

use super::types::{ModelRecord, ModelStatus, ModelUsageStats};
use crate::backend::InferenceBackend;
use crate::config::{BackendConfig, ModelConfig, OrchestratorConfig};
use crate::error::{CoreError, Result};
use crate::metrics::METRICS;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Context window assumed for models without one configured
pub const DEFAULT_CONTEXT_WINDOW: usize = 4096;

/// `None` while a load is running, then the load's outcome
type LoadOutcome = Option<std::result::Result<(), String>>;

#[derive(Default)]
struct ModelTable {
    records: HashMap<String, ModelRecord>,
    stats: HashMap<String, ModelUsageStats>,
    loads: HashMap<String, watch::Receiver<LoadOutcome>>,
    /// Flips to `true` once the record in `unloading` is gone
    unloads: HashMap<String, watch::Receiver<bool>>,
}

enum Pending {
    Load(watch::Receiver<LoadOutcome>),
    Unload(watch::Receiver<bool>),
}

impl ModelTable {
    fn begin_unload(&mut self, name: &str) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.unloads.insert(name.to_string(), rx);
        tx
    }
}

fn unavailable(model: &str, reason: impl Into<String>) -> CoreError {
    CoreError::ModelUnavailable {
        model: model.to_string(),
        reason: reason.into(),
    }
}

/// Model lifecycle manager
pub struct ModelManager {
    backend: Arc<dyn InferenceBackend>,
    catalog: HashMap<String, ModelConfig>,
    table: Arc<RwLock<ModelTable>>,
    load_timeout: Duration,
    unload_timeout: Duration,
    idle_threshold: Duration,
    reap_interval: Duration,
}

impl ModelManager {
    pub fn new(
        models: &[ModelConfig],
        backend_config: &BackendConfig,
        orchestrator_config: &OrchestratorConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let catalog = models
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect();

        Self {
            backend,
            catalog,
            table: Arc::new(RwLock::new(ModelTable::default())),
            load_timeout: backend_config.load_timeout(),
            unload_timeout: backend_config.unload_timeout(),
            idle_threshold: orchestrator_config.model_idle_threshold(),
            reap_interval: orchestrator_config.model_reap_interval(),
        }
    }

    /// Static configuration for a model
    pub fn model_config(&self, name: &str) -> Option<&ModelConfig> {
        self.catalog.get(name)
    }

    /// Check that the backend answers, then load every model flagged
    /// `load_on_startup`.
    ///
    /// An unreachable backend fails initialization. Startup models that fail
    /// to load are only logged.
    pub async fn initialize(&self) -> Result<()> {
        let available = self.backend.list_models().await.map_err(|e| {
            error!("Backend is not reachable: {}", e);
            CoreError::from(e)
        })?;
        info!("Backend reachable with {} available model(s)", available.len());

        for name in self.catalog.keys() {
            let known = available
                .iter()
                .any(|a| a == name || a.strip_suffix(":latest") == Some(name.as_str()));
            if !known {
                warn!("Configured model {} is not available on the backend", name);
            }
        }

        let startup: Vec<String> = self
            .catalog
            .values()
            .filter(|m| m.load_on_startup)
            .map(|m| m.name.clone())
            .collect();

        for name in startup {
            match self.ensure_loaded(&name).await {
                Ok(()) => info!("Loaded startup model {}", name),
                Err(e) => warn!("Failed to load startup model {}: {}", name, e),
            }
        }

        Ok(())
    }

    /// Make sure a model is resident, loading it if needed.
    ///
    /// A loaded model only has its `last_used` refreshed. Callers that arrive
    /// while a load is running wait for that load instead of starting another;
    /// callers that arrive during an unload wait for it to finish and then load
    /// the model again.
    /// The warm call runs in its own task so a caller dropping out does not
    /// leave the record stuck in `loading`.
    pub async fn ensure_loaded(&self, name: &str) -> Result<()> {
        loop {
            let pending = {
                let mut table = self.table.write().await;
                match table.records.get(name).map(|r| r.status) {
                    Some(ModelStatus::Loaded) => {
                        if let Some(record) = table.records.get_mut(name) {
                            record.last_used = Utc::now();
                        }
                        return Ok(());
                    }
                    Some(ModelStatus::Loading) => match table.loads.get(name) {
                        Some(rx) => Pending::Load(rx.clone()),
                        None => return Err(unavailable(name, "load state lost")),
                    },
                    Some(ModelStatus::Unloading) => match table.unloads.get(name) {
                        Some(rx) => Pending::Unload(rx.clone()),
                        None => return Err(unavailable(name, "unload state lost")),
                    },
                    None | Some(ModelStatus::Error) => Pending::Load(self.begin_load(&mut table, name)?),
                }
            };

            let mut outcome = match pending {
                Pending::Load(rx) => rx,
                Pending::Unload(mut done) => {
                    debug!("Waiting for model {} to finish unloading", name);
                    if done.wait_for(|gone| *gone).await.is_err() {
                        return Err(unavailable(name, "unload aborted"));
                    }
                    continue;
                }
            };

            let result = match outcome.wait_for(|o| o.is_some()).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };

            return match result {
                Some(Ok(())) => Ok(()),
                Some(Err(reason)) => Err(unavailable(name, reason)),
                None => Err(unavailable(name, "load aborted")),
            };
        }
    }

    fn begin_load(&self, table: &mut ModelTable, name: &str) -> Result<watch::Receiver<LoadOutcome>> {
        let config = self
            .catalog
            .get(name)
            .ok_or_else(|| unavailable(name, "model is not configured"))?;

        let now = Utc::now();
        table.records.insert(
            name.to_string(),
            ModelRecord {
                name: name.to_string(),
                specialization: config.specialization.clone(),
                priority: config.priority,
                context_window: config.context_window,
                status: ModelStatus::Loading,
                loaded_at: None,
                last_used: now,
                error: None,
            },
        );

        let (tx, rx) = watch::channel(None);
        table.loads.insert(name.to_string(), rx.clone());

        let backend = self.backend.clone();
        let state = self.table.clone();
        let load_timeout = self.load_timeout;
        let model = name.to_string();

        info!("Loading model {}", model);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(load_timeout, backend.warm(&model)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("load timed out after {:?}", load_timeout)),
            };

            {
                let mut table = state.write().await;
                table.loads.remove(&model);
                if let Some(record) = table.records.get_mut(&model) {
                    let now = Utc::now();
                    match &result {
                        Ok(()) => {
                            record.status = ModelStatus::Loaded;
                            record.loaded_at = Some(now);
                            record.last_used = now;
                            record.error = None;
                        }
                        Err(reason) => {
                            record.status = ModelStatus::Error;
                            record.error = Some(reason.clone());
                        }
                    }
                }
            }

            METRICS.record_model_load(&model, result.is_ok());
            match &result {
                Ok(()) => info!("Model {} loaded", model),
                Err(reason) => error!("Model {} failed to load: {}", model, reason),
            }

            let _ = tx.send(Some(result));
        });

        Ok(rx)
    }

    /// Remove a model from the backend.
    ///
    /// The record is removed even when the backend rejects the unload signal.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let (was_loaded, done) = {
            let mut table = self.table.write().await;
            let record = table
                .records
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("model {}", name)))?;

            match record.status {
                ModelStatus::Loading => return Err(unavailable(name, "model is still loading")),
                ModelStatus::Unloading => return Ok(()),
                status => {
                    record.status = ModelStatus::Unloading;
                    let was_loaded = status == ModelStatus::Loaded;
                    (was_loaded, table.begin_unload(name))
                }
            }
        };

        self.finish_unload(name, was_loaded, "manual", done).await;
        Ok(())
    }

    async fn finish_unload(&self, name: &str, was_loaded: bool, reason: &str, done: watch::Sender<bool>) {
        match tokio::time::timeout(self.unload_timeout, self.backend.unload(name)).await {
            Ok(Ok(())) => debug!("Backend released model {}", name),
            Ok(Err(e)) => warn!("Unload signal for model {} failed: {}", name, e),
            Err(_) => warn!("Unload signal for model {} timed out", name),
        }

        let mut table = self.table.write().await;
        // A concurrent load may have replaced the record; leave that one alone.
        if table.records.get(name).map(|r| r.status) == Some(ModelStatus::Unloading) {
            table.records.remove(name);
            if was_loaded {
                METRICS.record_model_unload(name, reason);
            }
            info!("Unloaded model {} ({})", name, reason);
        }
        table.unloads.remove(name);
        let _ = done.send(true);
    }

    /// Unload every loaded model idle for longer than the threshold.
    ///
    /// Models that are loading are never candidates. Returns the evicted names.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = chrono::Duration::seconds(self.idle_threshold.as_secs() as i64);

        let idle: Vec<(String, watch::Sender<bool>)> = {
            let mut table = self.table.write().await;
            let names: Vec<String> = table
                .records
                .values_mut()
                .filter(|r| r.is_idle(now, threshold))
                .map(|r| {
                    r.status = ModelStatus::Unloading;
                    r.name.clone()
                })
                .collect();
            let mut idle = Vec::with_capacity(names.len());
            for name in names {
                let done = table.begin_unload(&name);
                idle.push((name, done));
            }
            idle
        };

        if idle.is_empty() {
            return Vec::new();
        }

        info!("Evicting {} idle model(s)", idle.len());
        futures::future::join_all(idle.into_iter().map(|(name, done)| async move {
            self.finish_unload(&name, true, "idle", done).await;
            name
        }))
        .await
    }

    /// Run the idle reaper until `token` is cancelled
    pub fn spawn_reaper(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Model reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict_idle(Utc::now()).await;
                    }
                }
            }
        })
    }

    /// Highest-priority loaded model for a specialization; empty matches any.
    /// Ties go to the alphabetically first name.
    pub async fn select_best(&self, specialization: &str) -> Result<String> {
        let table = self.table.read().await;
        table
            .records
            .values()
            .filter(|r| {
                r.is_loaded() && (specialization.is_empty() || r.specialization == specialization)
            })
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.name.cmp(&a.name)))
            .map(|r| r.name.clone())
            .ok_or_else(|| CoreError::NoSuitableModel(specialization.to_string()))
    }

    /// Fold one request's outcome into the model's statistics
    pub async fn record_usage(&self, name: &str, tokens: u64, latency: Duration, error: Option<&str>) {
        let now = Utc::now();
        let mut table = self.table.write().await;
        table
            .stats
            .entry(name.to_string())
            .or_default()
            .record(tokens, latency, error, now);
        if let Some(record) = table.records.get_mut(name) {
            record.last_used = now;
        }
    }

    /// Refresh `last_used` without recording a request
    pub async fn touch(&self, name: &str) {
        let mut table = self.table.write().await;
        if let Some(record) = table.records.get_mut(name) {
            record.last_used = Utc::now();
        }
    }

    pub async fn context_window(&self, name: &str) -> usize {
        let table = self.table.read().await;
        table
            .records
            .get(name)
            .map(|r| r.context_window)
            .or_else(|| self.catalog.get(name).map(|m| m.context_window))
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    pub async fn record(&self, name: &str) -> Option<ModelRecord> {
        self.table.read().await.records.get(name).cloned()
    }

    pub async fn loaded_models(&self) -> Vec<ModelRecord> {
        let table = self.table.read().await;
        let mut loaded: Vec<ModelRecord> = table
            .records
            .values()
            .filter(|r| r.is_loaded())
            .cloned()
            .collect();
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        loaded
    }

    pub async fn stats(&self, name: &str) -> Option<ModelUsageStats> {
        self.table.read().await.stats.get(name).cloned()
    }

    /// Unload every loaded model
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .loaded_models()
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();

        for name in names {
            if let Err(e) = self.unload(&name).await {
                warn!("Failed to unload {} during shutdown: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendRequest, BackendResponse, BackendStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        warms: AtomicUsize,
        unloads: AtomicUsize,
        fail_warm: AtomicBool,
        fail_unload: AtomicBool,
        offline: AtomicBool,
        warm_delay_ms: u64,
        unload_delay_ms: u64,
    }

    #[async_trait]
    impl InferenceBackend for CountingBackend {
        async fn list_models(&self) -> std::result::Result<Vec<String>, BackendError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(BackendError::RequestFailed("connection refused".to_string()));
            }
            Ok(vec!["a:latest".to_string(), "b".to_string()])
        }

        async fn warm(&self, _model: &str) -> std::result::Result<(), BackendError> {
            self.warms.fetch_add(1, Ordering::SeqCst);
            if self.warm_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.warm_delay_ms)).await;
            }
            if self.fail_warm.load(Ordering::SeqCst) {
                return Err(BackendError::Upstream("HTTP 500: boom".to_string()));
            }
            Ok(())
        }

        async fn unload(&self, _model: &str) -> std::result::Result<(), BackendError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            if self.unload_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.unload_delay_ms)).await;
            }
            if self.fail_unload.load(Ordering::SeqCst) {
                return Err(BackendError::RequestFailed("connection refused".to_string()));
            }
            Ok(())
        }

        async fn generate(&self, _request: BackendRequest) -> std::result::Result<BackendResponse, BackendError> {
            Ok(BackendResponse::default())
        }

        async fn generate_stream(&self, _request: BackendRequest) -> std::result::Result<BackendStream, BackendError> {
            Err(BackendError::Stream("unsupported".to_string()))
        }
    }

    fn catalog() -> Vec<ModelConfig> {
        vec![
            ModelConfig::new("a", "chat", 1),
            ModelConfig::new("b", "code", 2),
            ModelConfig::new("c", "code", 1),
        ]
    }

    fn manager(backend: Arc<CountingBackend>) -> ModelManager {
        ModelManager::new(
            &catalog(),
            &BackendConfig::default(),
            &OrchestratorConfig::default(),
            backend,
        )
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let backend = Arc::new(CountingBackend::default());
        let manager = manager(backend.clone());

        manager.ensure_loaded("a").await.unwrap();
        manager.ensure_loaded("a").await.unwrap();

        assert_eq!(backend.warms.load(Ordering::SeqCst), 1);
        assert_eq!(manager.record("a").await.unwrap().status, ModelStatus::Loaded);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_warm_call() {
        let backend = Arc::new(CountingBackend {
            warm_delay_ms: 50,
            ..Default::default()
        });
        let manager = Arc::new(manager(backend.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_loaded("b").await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.warms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_marks_error() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail_warm.store(true, Ordering::SeqCst);
        let manager = manager(backend.clone());

        let err = manager.ensure_loaded("a").await.unwrap_err();
        assert!(matches!(err, CoreError::ModelUnavailable { .. }));

        let record = manager.record("a").await.unwrap();
        assert_eq!(record.status, ModelStatus::Error);
        assert!(record.error.unwrap().contains("boom"));

        backend.fail_warm.store(false, Ordering::SeqCst);
        manager.ensure_loaded("a").await.unwrap();
        assert_eq!(backend.warms.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_is_unavailable() {
        let manager = manager(Arc::new(CountingBackend::default()));
        assert!(matches!(
            manager.ensure_loaded("mystery").await,
            Err(CoreError::ModelUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_best_prefers_priority() {
        let manager = manager(Arc::new(CountingBackend::default()));
        for name in ["a", "b", "c"] {
            manager.ensure_loaded(name).await.unwrap();
        }

        assert_eq!(manager.select_best("code").await.unwrap(), "b");
        assert_eq!(manager.select_best("chat").await.unwrap(), "a");
        assert_eq!(manager.select_best("").await.unwrap(), "b");
        assert!(matches!(
            manager.select_best("vision").await,
            Err(CoreError::NoSuitableModel(_))
        ));
    }

    #[tokio::test]
    async fn test_unload_removes_record_even_when_backend_fails() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail_unload.store(true, Ordering::SeqCst);
        let manager = manager(backend.clone());

        manager.ensure_loaded("a").await.unwrap();
        manager.unload("a").await.unwrap();

        assert!(manager.record("a").await.is_none());
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_recent_and_loading() {
        let backend = Arc::new(CountingBackend {
            warm_delay_ms: 200,
            ..Default::default()
        });
        let manager = Arc::new(manager(backend.clone()));

        manager.ensure_loaded("a").await.unwrap();

        let loading = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure_loaded("b").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.record("b").await.unwrap().status, ModelStatus::Loading);

        // Nothing is idle yet.
        assert!(manager.evict_idle(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(11);
        let evicted = manager.evict_idle(later).await;
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(manager.record("a").await.is_none());

        loading.await.unwrap().unwrap();
        assert_eq!(manager.record("b").await.unwrap().status, ModelStatus::Loaded);
    }

    #[tokio::test]
    async fn test_record_usage_refreshes_last_used() {
        let manager = manager(Arc::new(CountingBackend::default()));
        manager.ensure_loaded("a").await.unwrap();
        let before = manager.record("a").await.unwrap().last_used;

        tokio::time::sleep(Duration::from_millis(5)).await;
        manager
            .record_usage("a", 120, Duration::from_millis(250), Some("timed out"))
            .await;

        let stats = manager.stats("a").await.unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.error_count, 1);
        assert!(manager.record("a").await.unwrap().last_used > before);
    }

    #[tokio::test]
    async fn test_initialize_loads_startup_models() {
        let backend = Arc::new(CountingBackend::default());
        let mut models = catalog();
        models[1].load_on_startup = true;
        let manager = ModelManager::new(
            &models,
            &BackendConfig::default(),
            &OrchestratorConfig::default(),
            backend.clone(),
        );

        manager.initialize().await.unwrap();
        let loaded = manager.loaded_models().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "b");

        manager.shutdown().await;
        assert!(manager.loaded_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_backend_unreachable() {
        let backend = Arc::new(CountingBackend::default());
        backend.offline.store(true, Ordering::SeqCst);
        let mut models = catalog();
        models[0].load_on_startup = true;
        let manager = ModelManager::new(
            &models,
            &BackendConfig::default(),
            &OrchestratorConfig::default(),
            backend.clone(),
        );

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(BackendError::RequestFailed(_))));
        assert_eq!(backend.warms.load(Ordering::SeqCst), 0);
        assert!(manager.loaded_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_loaded_waits_for_running_unload() {
        let backend = Arc::new(CountingBackend {
            unload_delay_ms: 300,
            ..Default::default()
        });
        let manager = Arc::new(manager(backend.clone()));
        manager.ensure_loaded("a").await.unwrap();

        let reaper = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .evict_idle(Utc::now() + chrono::Duration::minutes(11))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.record("a").await.unwrap().status, ModelStatus::Unloading);

        manager.ensure_loaded("a").await.unwrap();
        assert_eq!(manager.record("a").await.unwrap().status, ModelStatus::Loaded);
        assert_eq!(reaper.await.unwrap(), vec!["a".to_string()]);
        assert_eq!(backend.warms.load(Ordering::SeqCst), 2);
        assert_eq!(backend.unloads.load(Ordering::SeqCst), 1);
    }
}
