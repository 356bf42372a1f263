//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_int_gauge_with_registry,
};
use std::sync::Arc;
use std::time::Duration;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Inference pipeline
    pub inference_requests: CounterVec,
    pub inference_duration: HistogramVec,
    pub inference_tokens: CounterVec,
    pub inference_in_flight: IntGauge,

    // Model lifecycle
    pub model_loads: CounterVec,
    pub model_unloads: CounterVec,
    pub models_loaded: IntGauge,

    // Admission
    pub admission_rejections: CounterVec,
    pub budget_warnings: Counter,
    pub context_compressions: Counter,

    // Memory
    pub memory_stores: CounterVec,
    pub memory_retrievals: Counter,
    pub memory_consolidations: Counter,
    pub memory_pruned: Counter,
    pub embedding_failures: Counter,

    // Background work
    pub background_tasks_dropped: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let registry = Registry::new();

        let inference_requests = register_counter_vec_with_registry!(
            Opts::new("inference_requests_total", "Total inference requests"),
            &["request_type", "status"],
            registry
        )?;

        let inference_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "inference_request_duration_seconds",
                "Backend inference duration in seconds"
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["model"],
            registry
        )?;

        let inference_tokens = register_counter_vec_with_registry!(
            Opts::new("inference_tokens_total", "Tokens processed by the backend"),
            &["model", "kind"],
            registry
        )?;

        let inference_in_flight = register_int_gauge_with_registry!(
            Opts::new("inference_in_flight", "Requests currently registered as in flight"),
            registry
        )?;

        let model_loads = register_counter_vec_with_registry!(
            Opts::new("model_loads_total", "Model load attempts"),
            &["model", "status"],
            registry
        )?;

        let model_unloads = register_counter_vec_with_registry!(
            Opts::new("model_unloads_total", "Model unloads"),
            &["model", "reason"],
            registry
        )?;

        let models_loaded = register_int_gauge_with_registry!(
            Opts::new("models_loaded", "Models currently resident in the backend"),
            registry
        )?;

        let admission_rejections = register_counter_vec_with_registry!(
            Opts::new("admission_rejections_total", "Requests rejected at admission"),
            &["reason"],
            registry
        )?;

        let budget_warnings = register_counter_with_registry!(
            Opts::new("budget_warnings_total", "Budget threshold warnings emitted"),
            registry
        )?;

        let context_compressions = register_counter_with_registry!(
            Opts::new("context_compressions_total", "Contexts compressed to fit a window"),
            registry
        )?;

        let memory_stores = register_counter_vec_with_registry!(
            Opts::new("memory_stores_total", "Memories stored"),
            &["partition"],
            registry
        )?;

        let memory_retrievals = register_counter_with_registry!(
            Opts::new("memory_retrievals_total", "Memory retrieval queries"),
            registry
        )?;

        let memory_consolidations = register_counter_with_registry!(
            Opts::new("memory_consolidations_total", "Insights produced by consolidation"),
            registry
        )?;

        let memory_pruned = register_counter_with_registry!(
            Opts::new("memory_pruned_total", "Short-term memories pruned by cleanup"),
            registry
        )?;

        let embedding_failures = register_counter_with_registry!(
            Opts::new("embedding_failures_total", "Embedding computations that failed"),
            registry
        )?;

        let background_tasks_dropped = register_counter_vec_with_registry!(
            Opts::new("background_tasks_dropped_total", "Background tasks dropped on a full queue"),
            &["pool"],
            registry
        )?;

        Ok(Self {
            registry,
            inference_requests,
            inference_duration,
            inference_tokens,
            inference_in_flight,
            model_loads,
            model_unloads,
            models_loaded,
            admission_rejections,
            budget_warnings,
            context_compressions,
            memory_stores,
            memory_retrievals,
            memory_consolidations,
            memory_pruned,
            embedding_failures,
            background_tasks_dropped,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished inference request
    pub fn record_inference(&self, request_type: &str, status: &str) {
        self.inference_requests
            .with_label_values(&[request_type, status])
            .inc();
    }

    /// Record backend latency and token counts for a model
    pub fn record_generation(&self, model: &str, elapsed: Duration, prompt_tokens: u64, completion_tokens: u64) {
        self.inference_duration
            .with_label_values(&[model])
            .observe(elapsed.as_secs_f64());
        self.inference_tokens
            .with_label_values(&[model, "prompt"])
            .inc_by(prompt_tokens as f64);
        self.inference_tokens
            .with_label_values(&[model, "completion"])
            .inc_by(completion_tokens as f64);
    }

    /// Record a model load attempt
    pub fn record_model_load(&self, model: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.model_loads.with_label_values(&[model, status]).inc();
        if success {
            self.models_loaded.inc();
        }
    }

    /// Record a model leaving the backend
    pub fn record_model_unload(&self, model: &str, reason: &str) {
        self.model_unloads.with_label_values(&[model, reason]).inc();
        self.models_loaded.dec();
    }

    /// Record an admission rejection
    pub fn record_rejection(&self, reason: &str) {
        self.admission_rejections.with_label_values(&[reason]).inc();
    }

    /// Record a memory write into a partition
    pub fn record_memory_store(&self, long_term: bool) {
        let partition = if long_term { "long_term" } else { "short_term" };
        self.memory_stores.with_label_values(&[partition]).inc();
    }

    /// Record a background task that could not be queued
    pub fn record_task_dropped(&self, pool: &str) {
        self.background_tasks_dropped.with_label_values(&[pool]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
