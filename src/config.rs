//! Configuration for the inference core
//!
//! Every manager receives the section it needs at construction time. Values
//! come from serde defaults, an optional config file, `INFERENCE__*`
//! environment variables, and a handful of well-known overrides in
//! [`Config::from_env`].

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub models: Vec<ModelConfig>,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend inference engine connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the Ollama-compatible engine
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for a generation call in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for warming a model in seconds
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Timeout for the unload signal in seconds
    #[serde(default = "default_unload_timeout")]
    pub unload_timeout_secs: u64,

    /// keep_alive value sent when warming a model
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Circuit breaker failure threshold
    #[serde(default = "default_breaker_failures")]
    pub circuit_breaker_failures: usize,

    /// Circuit breaker reset timeout in seconds
    #[serde(default = "default_breaker_reset")]
    pub circuit_breaker_reset_secs: u64,
}

fn default_base_url() -> String { "http://localhost:11434".to_string() }
fn default_request_timeout() -> u64 { 300 }
fn default_load_timeout() -> u64 { 300 }
fn default_unload_timeout() -> u64 { 30 }
fn default_keep_alive() -> String { "5m".to_string() }
fn default_breaker_failures() -> usize { 5 }
fn default_breaker_reset() -> u64 { 30 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            load_timeout_secs: default_load_timeout(),
            unload_timeout_secs: default_unload_timeout(),
            keep_alive: default_keep_alive(),
            circuit_breaker_failures: default_breaker_failures(),
            circuit_breaker_reset_secs: default_breaker_reset(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }
}

/// Static metadata for a model the backend can serve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,

    /// Task family this model is preferred for ("chat", "code", ...)
    #[serde(default = "default_specialization")]
    pub specialization: String,

    /// Higher wins during selection
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_model_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub load_on_startup: bool,

    /// Extra backend options merged into every request for this model
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

fn default_specialization() -> String { "chat".to_string() }
fn default_context_window() -> usize { 4096 }
fn default_model_max_tokens() -> usize { 2048 }
fn default_temperature() -> f32 { 0.7 }

impl ModelConfig {
    pub fn new(name: impl Into<String>, specialization: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            specialization: specialization.into(),
            priority,
            context_window: default_context_window(),
            max_tokens: default_model_max_tokens(),
            temperature: default_temperature(),
            system_prompt: None,
            load_on_startup: false,
            parameters: HashMap::new(),
        }
    }
}

/// Which token estimator the budget manager uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Characters-per-token ratio with per-model profiles
    Ratio,
    /// cl100k BPE encoding
    Bpe,
}

/// Which summarizer compresses old conversation turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerKind {
    Truncate,
    Backend,
}

/// Rate limits, quotas, and context compression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_requests_per_minute")]
    pub max_requests_per_minute: u32,

    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: u64,

    /// Output tokens reserved for requests that set no `max_tokens`; also
    /// sent to the backend as the generation limit
    #[serde(default = "default_output_tokens")]
    pub default_output_tokens: u64,

    /// Total tokens per user per reset interval
    #[serde(default = "default_user_budget")]
    pub token_budget_per_user: u64,

    #[serde(default = "default_reset_interval")]
    pub reset_interval_hours: u64,

    /// Fraction of the budget that triggers a usage warning
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Consecutive violations before a user is blocked
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Upper bound on a single block, in minutes
    #[serde(default = "default_max_block_minutes")]
    pub max_block_minutes: u32,

    #[serde(default = "default_reset_check_interval")]
    pub reset_check_interval_secs: u64,

    #[serde(default = "default_estimator")]
    pub estimator: EstimatorKind,

    #[serde(default = "default_chars_per_token")]
    pub fallback_chars_per_token: f64,

    /// Fraction of messages kept verbatim when compressing
    #[serde(default = "default_tail_fraction")]
    pub compression_tail_fraction: f64,

    #[serde(default = "default_min_tail")]
    pub compression_min_tail: usize,

    #[serde(default = "default_summarizer")]
    pub summarizer: SummarizerKind,

    /// Model used by the backend summarizer; defaults to the first configured model
    #[serde(default)]
    pub summarizer_model: Option<String>,

    #[serde(default = "default_summary_cache_size")]
    pub summary_cache_size: u64,

    /// Users exempt from quota accounting
    #[serde(default)]
    pub unlimited_users: Vec<String>,
}

fn default_requests_per_minute() -> u32 { 60 }
fn default_max_tokens_per_request() -> u64 { 4096 }
fn default_output_tokens() -> u64 { 512 }
fn default_user_budget() -> u64 { 100_000 }
fn default_reset_interval() -> u64 { 24 }
fn default_warning_threshold() -> f64 { 0.8 }
fn default_violation_threshold() -> u32 { 3 }
fn default_max_block_minutes() -> u32 { 60 }
fn default_reset_check_interval() -> u64 { 3600 }
fn default_estimator() -> EstimatorKind { EstimatorKind::Ratio }
fn default_chars_per_token() -> f64 { 4.0 }
fn default_tail_fraction() -> f64 { 0.25 }
fn default_min_tail() -> usize { 5 }
fn default_summarizer() -> SummarizerKind { SummarizerKind::Truncate }
fn default_summary_cache_size() -> u64 { 1000 }

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_requests_per_minute(),
            max_tokens_per_request: default_max_tokens_per_request(),
            default_output_tokens: default_output_tokens(),
            token_budget_per_user: default_user_budget(),
            reset_interval_hours: default_reset_interval(),
            warning_threshold: default_warning_threshold(),
            violation_threshold: default_violation_threshold(),
            max_block_minutes: default_max_block_minutes(),
            reset_check_interval_secs: default_reset_check_interval(),
            estimator: default_estimator(),
            fallback_chars_per_token: default_chars_per_token(),
            compression_tail_fraction: default_tail_fraction(),
            compression_min_tail: default_min_tail(),
            summarizer: default_summarizer(),
            summarizer_model: None,
            summary_cache_size: default_summary_cache_size(),
            unlimited_users: Vec::new(),
        }
    }
}

impl BudgetConfig {
    pub fn reset_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reset_interval_hours as i64)
    }

    /// Tokens allowed per minute, derived from the per-request and rpm limits
    pub fn tokens_per_minute(&self) -> u64 {
        self.max_tokens_per_request * self.max_requests_per_minute as u64
    }

    pub fn reset_check_interval(&self) -> Duration {
        Duration::from_secs(self.reset_check_interval_secs)
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Write conversation turns to memory after successful requests
    #[serde(default = "default_true")]
    pub enable_memory_persist: bool,

    /// Route by request type; when off any loaded model may serve
    #[serde(default = "default_true")]
    pub enable_model_routing: bool,

    /// Compress oversized contexts
    #[serde(default = "default_true")]
    pub enable_token_optimizer: bool,

    #[serde(default)]
    pub enable_tool_use: bool,
}

fn default_true() -> bool { true }

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            enable_memory_persist: true,
            enable_model_routing: true,
            enable_token_optimizer: true,
            enable_tool_use: false,
        }
    }
}

/// Embedding source for memory items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Deterministic hashing embedder, no network
    Local,
    /// Backend `/api/embeddings` endpoint
    Ollama,
}

/// Memory manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Items at or above this importance go to long-term memory
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,

    /// Content must be longer than this to get an embedding
    #[serde(default = "default_min_embedding_length")]
    pub min_embedding_length: usize,

    /// Vector length the embedding provider must produce
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: EmbeddingProviderKind,

    /// Model used by the Ollama embedding provider
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_cache_size")]
    pub embedding_cache_size: u64,

    #[serde(default = "default_max_memories")]
    pub max_memories_per_user: usize,

    #[serde(default = "default_consolidation_interval")]
    pub consolidation_interval_hours: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_hours: u64,

    /// Freshness half-life in days
    #[serde(default = "default_half_life")]
    pub freshness_half_life_days: f64,

    /// Short-term items older than this may be pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Short-term items at or below this importance may be pruned
    #[serde(default = "default_prune_importance")]
    pub prune_importance: f64,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Cosine similarity that links two items into one cluster
    #[serde(default = "default_cluster_similarity")]
    pub cluster_similarity: f32,
}

fn default_importance_threshold() -> f64 { 0.3 }
fn default_min_embedding_length() -> usize { 10 }
fn default_embedding_dimensions() -> usize { 300 }
fn default_embedding_provider() -> EmbeddingProviderKind { EmbeddingProviderKind::Local }
fn default_embedding_model() -> String { "nomic-embed-text".to_string() }
fn default_embedding_cache_size() -> u64 { 10_000 }
fn default_max_memories() -> usize { 10_000 }
fn default_consolidation_interval() -> u64 { 24 }
fn default_cleanup_interval() -> u64 { 168 }
fn default_half_life() -> f64 { 30.0 }
fn default_retention_days() -> i64 { 30 }
fn default_prune_importance() -> f64 { 0.2 }
fn default_min_cluster_size() -> usize { 3 }
fn default_cluster_similarity() -> f32 { 0.75 }

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            importance_threshold: default_importance_threshold(),
            min_embedding_length: default_min_embedding_length(),
            embedding_dimensions: default_embedding_dimensions(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            embedding_cache_size: default_embedding_cache_size(),
            max_memories_per_user: default_max_memories(),
            consolidation_interval_hours: default_consolidation_interval(),
            cleanup_interval_hours: default_cleanup_interval(),
            freshness_half_life_days: default_half_life(),
            retention_days: default_retention_days(),
            prune_importance: default_prune_importance(),
            min_cluster_size: default_min_cluster_size(),
            cluster_similarity: default_cluster_similarity(),
        }
    }
}

impl MemoryConfig {
    pub fn consolidation_interval(&self) -> Duration {
        Duration::from_secs(self.consolidation_interval_hours * 3600)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }
}

/// Request pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for one backend call in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Capacity of the per-request stream channel
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Memories injected per request when none is specified
    #[serde(default = "default_memory_depth")]
    pub memory_depth: usize,

    #[serde(default = "default_memory_max_age")]
    pub memory_max_age_hours: i64,

    #[serde(default = "default_memory_similarity")]
    pub memory_similarity_threshold: f32,

    #[serde(default = "default_writer_workers")]
    pub memory_writer_workers: usize,

    #[serde(default = "default_writer_queue")]
    pub memory_writer_queue: usize,

    /// How long finished request snapshots stay queryable, in seconds
    #[serde(default = "default_finished_ttl")]
    pub finished_ttl_secs: u64,

    #[serde(default = "default_model_idle")]
    pub model_idle_threshold_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub model_reap_interval_secs: u64,
}

fn default_stream_buffer() -> usize { 100 }
fn default_memory_depth() -> usize { 5 }
fn default_memory_max_age() -> i64 { 24 }
fn default_memory_similarity() -> f32 { 0.7 }
fn default_writer_workers() -> usize { 2 }
fn default_writer_queue() -> usize { 256 }
fn default_finished_ttl() -> u64 { 600 }
fn default_model_idle() -> u64 { 600 }
fn default_reap_interval() -> u64 { 30 }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            stream_buffer: default_stream_buffer(),
            memory_depth: default_memory_depth(),
            memory_max_age_hours: default_memory_max_age(),
            memory_similarity_threshold: default_memory_similarity(),
            memory_writer_workers: default_writer_workers(),
            memory_writer_queue: default_writer_queue(),
            finished_ttl_secs: default_finished_ttl(),
            model_idle_threshold_secs: default_model_idle(),
            model_reap_interval_secs: default_reap_interval(),
        }
    }
}

impl OrchestratorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn finished_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_ttl_secs)
    }

    pub fn model_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.model_idle_threshold_secs)
    }

    pub fn model_reap_interval(&self) -> Duration {
        Duration::from_secs(self.model_reap_interval_secs)
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load from a file (any format the config crate understands) layered
    /// with `INFERENCE__SECTION__KEY` environment variables
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(true))
            .add_source(
                ::config::Environment::with_prefix("INFERENCE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| CoreError::Configuration(format!("{}: {}", path.display(), e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CoreError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply well-known environment overrides
    pub fn from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("OLLAMA_BASE_URL") {
            self.backend.base_url = val;
        }

        if let Ok(val) = std::env::var("INFERENCE_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.backend.request_timeout_secs = secs;
                self.orchestrator.request_timeout_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("INFERENCE_USER_TOKEN_BUDGET") {
            if let Ok(budget) = val.parse() {
                self.budget.token_budget_per_user = budget;
            }
        }

        if let Ok(val) = std::env::var("INFERENCE_MAX_REQUESTS_PER_MINUTE") {
            if let Ok(rpm) = val.parse() {
                self.budget.max_requests_per_minute = rpm;
            }
        }

        if let Ok(val) = std::env::var("INFERENCE_ENABLE_MEMORY") {
            self.features.enable_memory_persist = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("INFERENCE_LOG_JSON") {
            self.logging.json = val.to_lowercase() == "true" || val == "1";
        }

        self
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.budget.warning_threshold) {
            return Err(CoreError::Configuration(format!(
                "budget.warning_threshold must be within [0, 1], got {}",
                self.budget.warning_threshold
            )));
        }

        if self.budget.fallback_chars_per_token <= 0.0 {
            return Err(CoreError::Configuration(
                "budget.fallback_chars_per_token must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.budget.compression_tail_fraction) {
            return Err(CoreError::Configuration(
                "budget.compression_tail_fraction must be within [0, 1]".to_string(),
            ));
        }

        if self.budget.violation_threshold == 0 {
            return Err(CoreError::Configuration(
                "budget.violation_threshold must be at least 1".to_string(),
            ));
        }

        if self.budget.default_output_tokens > self.budget.max_tokens_per_request {
            return Err(CoreError::Configuration(format!(
                "budget.default_output_tokens ({}) exceeds max_tokens_per_request ({})",
                self.budget.default_output_tokens, self.budget.max_tokens_per_request
            )));
        }

        if self.orchestrator.stream_buffer == 0 || self.orchestrator.memory_writer_queue == 0 {
            return Err(CoreError::Configuration(
                "orchestrator channel capacities must be positive".to_string(),
            ));
        }

        if self.memory.embedding_dimensions == 0 {
            return Err(CoreError::Configuration(
                "memory.embedding_dimensions must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(CoreError::Configuration("model name must not be empty".to_string()));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(CoreError::Configuration(format!(
                    "model {} configured twice",
                    model.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a model's configuration by name
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.base_url, "http://localhost:11434");
        assert_eq!(config.budget.max_requests_per_minute, 60);
        assert_eq!(config.budget.warning_threshold, 0.8);
        assert_eq!(config.memory.importance_threshold, 0.3);
        assert_eq!(config.orchestrator.stream_buffer, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tokens_per_minute_derived() {
        let budget = BudgetConfig::default();
        assert_eq!(budget.tokens_per_minute(), 4096 * 60);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.budget.warning_threshold = 1.5;
        assert!(matches!(config.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_models() {
        let mut config = Config::default();
        config.models.push(ModelConfig::new("llama3.2", "chat", 1));
        config.models.push(ModelConfig::new("llama3.2", "code", 2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_config_serde_defaults() {
        let model: ModelConfig = serde_json::from_str(r#"{"name": "codellama"}"#).unwrap();
        assert_eq!(model.specialization, "chat");
        assert_eq!(model.context_window, 4096);
        assert_eq!(model.priority, 0);
        assert!(!model.load_on_startup);
    }

    #[test]
    fn test_from_file_with_models() {
        let dir = std::env::temp_dir().join(format!("inference-core-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("core.json");
        std::fs::write(
            &path,
            r#"{
                "models": [
                    {"name": "codellama", "specialization": "code", "priority": 2, "load_on_startup": true}
                ],
                "budget": {"token_budget_per_user": 5000}
            }"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.budget.token_budget_per_user, 5000);
        assert_eq!(config.budget.max_requests_per_minute, 60);
        let model = config.model("codellama").unwrap();
        assert_eq!(model.priority, 2);
        assert!(model.load_on_startup);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("OLLAMA_BASE_URL", "http://gpu-box:11434");
        std::env::set_var("INFERENCE_USER_TOKEN_BUDGET", "2500");

        let config = Config::default().from_env();
        assert_eq!(config.backend.base_url, "http://gpu-box:11434");
        assert_eq!(config.budget.token_budget_per_user, 2500);

        std::env::remove_var("OLLAMA_BASE_URL");
        std::env::remove_var("INFERENCE_USER_TOKEN_BUDGET");
    }
}
