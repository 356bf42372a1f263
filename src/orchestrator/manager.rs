//! Inference orchestrator
//!
//! Runs each request through validation, admission, model resolution,
//! optional recall and compression, and the backend call. Requests are
//! tracked in an in-flight table from just before the backend call until
//! they reach a terminal state; finished snapshots stay queryable for a
//! while afterwards.

use super::models::{
    InferenceRequest, InferenceResult, InferenceSnapshot, InferenceStatus, PerformanceStats,
    StreamChunk, TokenUsage,
};
use super::tasks::TaskPool;
use crate::backend::{BackendRequest, BackendResponse, InferenceBackend};
use crate::budget::{TokenBudgetManager, UsageRequest};
use crate::config::{FeatureConfig, OrchestratorConfig};
use crate::error::{CoreError, Result};
use crate::memory::{MemoryManager, MemoryQuery, MemoryType, NewMemory};
use crate::message::{last_user_content, Message, Role};
use crate::metrics::METRICS;
use crate::model::ModelManager;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MEMORY_HEADER: &str = "Relevant context from past conversations:";
/// Counter label for requests that name no model
const AUTO_MODEL: &str = "auto";

struct InFlightEntry {
    snapshot: InferenceSnapshot,
    token: CancellationToken,
}

type InFlightTable = Arc<DashMap<String, InFlightEntry>>;

/// Removes a request from the in-flight table when dropped.
///
/// A guard dropped without [`finish`](Self::finish) (a caller abandoning the
/// future, or a panic) records the request as cancelled. The budget side of
/// an abandoned request is handled by [`Reservation`].
struct InFlightGuard {
    id: String,
    request_type: &'static str,
    table: InFlightTable,
    finished: moka::sync::Cache<String, InferenceSnapshot>,
    outcome: Option<(InferenceStatus, Option<String>, Option<TokenUsage>)>,
}

impl InFlightGuard {
    fn set_status(&self, status: InferenceStatus) {
        if let Some(mut entry) = self.table.get_mut(&self.id) {
            entry.snapshot.status = status;
        }
    }

    fn finish(mut self, status: InferenceStatus, error: Option<String>, usage: Option<TokenUsage>) {
        self.outcome = Some((status, error, usage));
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let (status, error, usage) = self.outcome.take().unwrap_or((
            InferenceStatus::Cancelled,
            Some("request abandoned".to_string()),
            None,
        ));

        if let Some((_, entry)) = self.table.remove(&self.id) {
            let mut snapshot = entry.snapshot;
            snapshot.status = status;
            snapshot.finished_at = Some(Utc::now());
            snapshot.error = error;
            snapshot.usage = usage;
            self.finished.insert(self.id.clone(), snapshot);
        }

        METRICS.inference_in_flight.dec();
        METRICS.record_inference(self.request_type, status.as_str());
    }
}

/// Tokens held against a user's budget for one admitted request.
///
/// Dropped before [`settle`](Self::settle) completes (a caller abandoning the
/// future after admission) the full reservation is refunded.
struct Reservation {
    budget: Arc<TokenBudgetManager>,
    usage: UsageRequest,
    reserved: u64,
    settled: AtomicBool,
}

impl Reservation {
    /// Replace the reservation with the tokens actually consumed
    async fn settle(&self, consumed: u64) {
        self.budget
            .settle_usage(&self.usage, self.reserved, consumed)
            .await;
        self.settled.store(true, Ordering::Release);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.reserved == 0 || self.settled.load(Ordering::Acquire) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to refund {} tokens for user {}",
                self.reserved, self.usage.user_id
            );
            return;
        };

        debug!(
            "Refunding {} tokens for abandoned request of user {}",
            self.reserved, self.usage.user_id
        );
        let budget = self.budget.clone();
        let usage = self.usage.clone();
        let reserved = self.reserved;
        handle.spawn(async move {
            budget.release_usage(&usage, reserved).await;
        });
    }
}

/// A request that passed admission and is ready for the backend
struct Prepared {
    request: InferenceRequest,
    model: String,
    messages: Vec<Message>,
    reservation: Reservation,
    /// Generation limit, from the request or the configured default
    output_limit: u64,
    input_estimate: u64,
    warning: Option<String>,
    memories_used: usize,
    compressed: bool,
}

/// Streaming request handle
pub struct InferenceStream {
    pub request_id: String,
    pub receiver: mpsc::Receiver<StreamChunk>,
}

#[derive(Default)]
struct StreamProgress {
    content: String,
    tokens: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    finish_reason: Option<String>,
}

/// Inference orchestrator
pub struct InferenceOrchestrator {
    config: OrchestratorConfig,
    features: FeatureConfig,
    models: Arc<ModelManager>,
    budget: Arc<TokenBudgetManager>,
    memory: Arc<MemoryManager>,
    backend: Arc<dyn InferenceBackend>,
    in_flight: InFlightTable,
    finished: moka::sync::Cache<String, InferenceSnapshot>,
    writer: TaskPool,
    shutdown: CancellationToken,
}

impl InferenceOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        features: FeatureConfig,
        models: Arc<ModelManager>,
        budget: Arc<TokenBudgetManager>,
        memory: Arc<MemoryManager>,
        backend: Arc<dyn InferenceBackend>,
        shutdown: CancellationToken,
    ) -> Self {
        let finished = moka::sync::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.finished_ttl())
            .build();
        let writer = TaskPool::new(
            "memory_writer",
            config.memory_writer_workers,
            config.memory_writer_queue,
        );

        Self {
            config,
            features,
            models,
            budget,
            memory,
            backend,
            in_flight: Arc::new(DashMap::new()),
            finished,
            writer,
            shutdown,
        }
    }

    /// Run a request to completion
    pub async fn process(&self, request: InferenceRequest) -> Result<InferenceResult> {
        let started = Instant::now();
        let prepared = self.prepare(request).await?;
        let (guard, token) = self.register(&prepared);
        guard.set_status(InferenceStatus::Processing);

        let timeout = self.config.request_timeout();
        let backend_request = self.backend_request(&prepared, false);

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(CoreError::Cancelled),
            result = tokio::time::timeout(timeout, self.backend.generate(backend_request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(CoreError::Backend(e)),
                Err(_) => Err(CoreError::Timeout(timeout)),
            },
        };

        match outcome {
            Ok(response) => Ok(self.complete(prepared, response, started, guard).await),
            Err(e) => {
                let status = if matches!(e, CoreError::Cancelled) {
                    InferenceStatus::Cancelled
                } else {
                    InferenceStatus::Failed
                };
                self.abort(&prepared, &e, started, 0).await;
                guard.finish(status, Some(e.to_string()), None);
                Err(e)
            }
        }
    }

    /// Start a streaming request.
    ///
    /// Admission and model loading happen before this returns; generation
    /// runs in a background task that feeds the returned channel.
    pub async fn process_streaming(self: &Arc<Self>, request: InferenceRequest) -> Result<InferenceStream> {
        let started = Instant::now();
        let prepared = self.prepare(request).await?;
        let (guard, token) = self.register(&prepared);

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let request_id = prepared.request.id.clone();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            guard.set_status(InferenceStatus::Streaming);
            let mut progress = StreamProgress::default();
            let outcome = this.run_stream(&prepared, &token, &tx, &mut progress).await;

            match outcome {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    let usage = this.stream_usage(&prepared, &progress);
                    this.settle_success(&prepared, &progress.content, usage, elapsed).await;
                    debug!(
                        "Stream {} finished ({:?}, {} tokens)",
                        prepared.request.id,
                        progress.finish_reason.as_deref().unwrap_or("stop"),
                        usage.output_tokens
                    );
                    guard.finish(InferenceStatus::Completed, None, Some(usage));
                }
                Err(CoreError::Cancelled) => {
                    let usage = this.stream_usage(&prepared, &progress);
                    let cancelled = CoreError::Cancelled;
                    this.abort(&prepared, &cancelled, started, usage.total_tokens).await;
                    info!("Stream {} cancelled after {} tokens", prepared.request.id, progress.tokens);
                    guard.finish(InferenceStatus::Cancelled, Some(cancelled.to_string()), Some(usage));
                }
                Err(e) => {
                    this.abort(&prepared, &e, started, 0).await;
                    let chunk = StreamChunk::failure(e.to_string(), progress.tokens);
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tx.send(chunk) => {}
                    }
                    guard.finish(InferenceStatus::Failed, Some(e.to_string()), None);
                }
            }
            drop(tx);
        });

        Ok(InferenceStream {
            request_id,
            receiver: rx,
        })
    }

    /// Cancel an in-flight request
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        match self.in_flight.get(request_id) {
            Some(entry) => {
                info!("Cancelling request {}", request_id);
                entry.token.cancel();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("request {} is not in flight", request_id))),
        }
    }

    /// Current or recently finished state of a request
    pub fn status(&self, request_id: &str) -> Option<InferenceSnapshot> {
        self.in_flight
            .get(request_id)
            .map(|entry| entry.snapshot.clone())
            .or_else(|| self.finished.get(request_id))
    }

    /// In-flight requests, oldest first
    pub fn list_active(&self) -> Vec<InferenceSnapshot> {
        let mut active: Vec<InferenceSnapshot> = self
            .in_flight
            .iter()
            .map(|entry| entry.snapshot.clone())
            .collect();
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Cancel everything in flight and drain pending memory writes
    pub async fn shutdown(&self, grace: Duration) {
        let active = self.in_flight.len();
        if active > 0 {
            info!("Cancelling {} in-flight request(s)", active);
        }
        self.shutdown.cancel();
        self.writer.shutdown(grace).await;
    }

    fn validate(&self, request: &InferenceRequest) -> Result<()> {
        if request.user_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("user_id is required".to_string()));
        }
        let has_system_prompt = request
            .params
            .system_prompt
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false);
        if request.messages.is_empty() && !has_system_prompt {
            return Err(CoreError::InvalidRequest(
                "messages or system prompt required".to_string(),
            ));
        }
        if !request.params.tools.is_empty() && !self.features.enable_tool_use {
            return Err(CoreError::InvalidRequest("tool use is disabled".to_string()));
        }
        if let Some(max_tokens) = request.params.max_tokens {
            let limit = self.budget.config().max_tokens_per_request;
            if max_tokens > limit {
                return Err(CoreError::InvalidRequest(format!(
                    "max_tokens {} exceeds the per-request limit of {}",
                    max_tokens, limit
                )));
            }
        }
        Ok(())
    }

    async fn prepare(&self, request: InferenceRequest) -> Result<Prepared> {
        self.validate(&request)?;

        let requested_model = request.model.clone().filter(|m| !m.trim().is_empty());
        let estimate_model = requested_model.as_deref().unwrap_or("");
        let input_estimate = self.budget.estimate_messages(&request.messages, estimate_model) as u64
            + request
                .params
                .system_prompt
                .as_deref()
                .map(|p| self.budget.estimate_tokens(p, estimate_model) as u64)
                .unwrap_or(0);

        let output_limit = request
            .params
            .max_tokens
            .unwrap_or(self.budget.config().default_output_tokens);

        let usage = UsageRequest {
            user_id: request.user_id.clone(),
            model: requested_model.clone().unwrap_or_else(|| AUTO_MODEL.to_string()),
            session_id: request.session_id.clone(),
            input_tokens: input_estimate,
            output_tokens: output_limit,
        };

        let decision = self.budget.check_usage(&usage).await;
        if let Some(rejection) = decision.to_error() {
            METRICS.record_inference(request.request_type.as_str(), rejection.kind());
            return Err(rejection);
        }
        let reservation = Reservation {
            budget: self.budget.clone(),
            usage,
            reserved: decision.reserved,
            settled: AtomicBool::new(false),
        };

        let model = match self.resolve_model(&request, requested_model).await {
            Ok(model) => model,
            Err(e) => {
                reservation.settle(0).await;
                METRICS.record_inference(request.request_type.as_str(), e.kind());
                return Err(e);
            }
        };

        let mut messages = self.initial_messages(&request, &model);

        let mut memories_used = 0;
        if request.params.use_memory {
            let depth = request.params.memory_depth.unwrap_or(self.config.memory_depth);
            match self.recall(&request, &messages, depth).await {
                Ok(Some((augmented, count))) => {
                    messages = augmented;
                    memories_used = count;
                }
                Ok(None) => {}
                Err(e) => warn!("Memory recall failed for request {}, continuing without: {}", request.id, e),
            }
        }

        let mut compressed = false;
        if request.params.compress_context && self.features.enable_token_optimizer {
            let window = self.models.context_window(&model).await;
            let reply = output_limit as usize;
            let target = window.saturating_sub(reply).max(window / 2);
            let result = self.budget.optimize_context(messages, target, &model).await;
            compressed = result.was_compressed();
            messages = result.messages;
        }

        Ok(Prepared {
            request,
            model,
            messages,
            reservation,
            output_limit,
            input_estimate,
            warning: decision.warning,
            memories_used,
            compressed,
        })
    }

    async fn resolve_model(&self, request: &InferenceRequest, requested: Option<String>) -> Result<String> {
        let model = match requested {
            Some(model) => model,
            None if self.features.enable_model_routing => {
                self.models
                    .select_best(request.request_type.specialization())
                    .await?
            }
            None => self.models.select_best("").await?,
        };

        self.models.ensure_loaded(&model).await?;
        debug!("Request {} routed to {}", request.id, model);
        Ok(model)
    }

    /// Request messages with the system prompt applied.
    ///
    /// An explicit system prompt goes first; otherwise the model's configured
    /// prompt is used when the conversation has no system message.
    fn initial_messages(&self, request: &InferenceRequest, model: &str) -> Vec<Message> {
        let mut messages = request.messages.clone();
        let explicit = request
            .params
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty());

        match explicit {
            Some(prompt) => messages.insert(0, Message::system(prompt)),
            None => {
                let configured = self
                    .models
                    .model_config(model)
                    .and_then(|c| c.system_prompt.as_deref())
                    .filter(|p| !p.trim().is_empty());
                if let Some(prompt) = configured {
                    if !messages.iter().any(Message::is_system) {
                        messages.insert(0, Message::system(prompt));
                    }
                }
            }
        }
        messages
    }

    /// Insert recalled memories after the leading system messages
    async fn recall(
        &self,
        request: &InferenceRequest,
        messages: &[Message],
        depth: usize,
    ) -> Result<Option<(Vec<Message>, usize)>> {
        let Some(query_text) = last_user_content(messages) else {
            return Ok(None);
        };
        if depth == 0 {
            return Ok(None);
        }

        let query = MemoryQuery {
            user_id: request.user_id.clone(),
            query: query_text.to_string(),
            max_age: Some(chrono::Duration::hours(self.config.memory_max_age_hours)),
            similarity_threshold: self.config.memory_similarity_threshold,
            limit: depth,
            ..Default::default()
        };
        let memories = self.memory.retrieve(&query).await?;
        if memories.is_empty() {
            return Ok(None);
        }

        let lines: Vec<String> = memories
            .iter()
            .map(|m| format!("- {}", m.item.content))
            .collect();
        let recall = Message::system(format!("{}\n{}", MEMORY_HEADER, lines.join("\n")));

        let position = messages.iter().take_while(|m| m.is_system()).count();
        let mut augmented = messages.to_vec();
        augmented.insert(position, recall);
        Ok(Some((augmented, memories.len())))
    }

    fn register(&self, prepared: &Prepared) -> (InFlightGuard, CancellationToken) {
        let token = self.shutdown.child_token();
        let request = &prepared.request;
        let snapshot = InferenceSnapshot {
            id: request.id.clone(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            model: prepared.model.clone(),
            request_type: request.request_type,
            status: InferenceStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            usage: None,
        };

        self.in_flight.insert(
            request.id.clone(),
            InFlightEntry {
                snapshot,
                token: token.clone(),
            },
        );
        METRICS.inference_in_flight.inc();

        let guard = InFlightGuard {
            id: request.id.clone(),
            request_type: request.request_type.as_str(),
            table: self.in_flight.clone(),
            finished: self.finished.clone(),
            outcome: None,
        };
        (guard, token)
    }

    fn backend_request(&self, prepared: &Prepared, stream: bool) -> BackendRequest {
        let mut request = BackendRequest::chat(prepared.model.clone(), prepared.messages.clone());
        request.stream = stream;

        if let Some(config) = self.models.model_config(&prepared.model) {
            for (key, value) in &config.parameters {
                request.options.insert(key.clone(), value.clone());
            }
            request
                .options
                .insert("temperature".to_string(), json!(config.temperature));
        }
        request.options.extend(prepared.request.params.to_backend_options());
        request
            .options
            .entry("num_predict".to_string())
            .or_insert_with(|| json!(prepared.output_limit));
        request
    }

    async fn run_stream(
        &self,
        prepared: &Prepared,
        token: &CancellationToken,
        tx: &mpsc::Sender<StreamChunk>,
        progress: &mut StreamProgress,
    ) -> Result<()> {
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let backend_request = self.backend_request(prepared, true);
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Err(CoreError::Cancelled),
            _ = &mut deadline => return Err(CoreError::Timeout(timeout)),
            result = self.backend.generate_stream(backend_request) => result?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(CoreError::Cancelled),
                _ = &mut deadline => return Err(CoreError::Timeout(timeout)),
                item = stream.next() => item,
            };

            let response = match next {
                Some(Ok(response)) => response,
                Some(Err(e)) => return Err(CoreError::Backend(e)),
                None => {
                    // Backend closed without a done marker; finish the stream ourselves.
                    let chunk = StreamChunk {
                        content: String::new(),
                        done: true,
                        tokens: progress.tokens,
                        error: None,
                    };
                    send_chunk(tx, token, chunk).await?;
                    return Ok(());
                }
            };

            let piece = response.content().to_string();
            progress.tokens += self.budget.estimate_tokens(&piece, &prepared.model) as u64;
            if response.done {
                progress.prompt_tokens = response.prompt_tokens();
                progress.completion_tokens = response.completion_tokens();
                if progress.completion_tokens > 0 {
                    progress.tokens = progress.completion_tokens;
                }
                progress.finish_reason = response.done_reason.clone();
            }
            progress.content.push_str(&piece);

            let chunk = StreamChunk {
                content: piece,
                done: response.done,
                tokens: progress.tokens,
                error: None,
            };
            send_chunk(tx, token, chunk).await?;

            if response.done {
                return Ok(());
            }
        }
    }

    fn stream_usage(&self, prepared: &Prepared, progress: &StreamProgress) -> TokenUsage {
        let input = if progress.prompt_tokens > 0 {
            progress.prompt_tokens
        } else {
            prepared.input_estimate
        };
        TokenUsage::new(input, progress.tokens)
    }

    async fn complete(
        &self,
        prepared: Prepared,
        response: BackendResponse,
        started: Instant,
        guard: InFlightGuard,
    ) -> InferenceResult {
        let elapsed = started.elapsed();
        let content = response.content().to_string();

        let input = match response.prompt_tokens() {
            0 => prepared.input_estimate,
            n => n,
        };
        let output = match response.completion_tokens() {
            0 => self.budget.estimate_tokens(&content, &prepared.model) as u64,
            n => n,
        };
        let usage = TokenUsage::new(input, output);

        self.settle_success(&prepared, &content, usage, elapsed).await;
        guard.finish(InferenceStatus::Completed, None, Some(usage));

        InferenceResult {
            request_id: prepared.request.id.clone(),
            content,
            model: prepared.model.clone(),
            finish_reason: response.done_reason.clone().unwrap_or_else(|| "stop".to_string()),
            usage,
            duration: elapsed,
            performance: PerformanceStats {
                processing_time_ms: response.total_duration.unwrap_or(0) / 1_000_000,
                load_time_ms: response.load_duration.unwrap_or(0) / 1_000_000,
                tokens_per_second: response.tokens_per_second(),
            },
            warning: prepared.warning.clone(),
            memories_used: prepared.memories_used,
            compressed: prepared.compressed,
        }
    }

    /// Stats, usage settlement, and memory writes for a successful request
    async fn settle_success(&self, prepared: &Prepared, content: &str, usage: TokenUsage, elapsed: Duration) {
        self.models
            .record_usage(&prepared.model, usage.total_tokens, elapsed, None)
            .await;
        prepared.reservation.settle(usage.total_tokens).await;
        METRICS.record_generation(&prepared.model, elapsed, usage.input_tokens, usage.output_tokens);

        info!(
            "Request {} for user {} completed on {} in {:?} ({} tokens)",
            prepared.request.id, prepared.request.user_id, prepared.model, elapsed, usage.total_tokens
        );

        if prepared.request.params.use_memory && self.features.enable_memory_persist {
            self.remember(prepared, content);
        }
    }

    /// Bookkeeping for a request that did not complete
    async fn abort(&self, prepared: &Prepared, err: &CoreError, started: Instant, consumed: u64) {
        let elapsed = started.elapsed();
        match err {
            CoreError::Cancelled => self.models.touch(&prepared.model).await,
            _ => {
                let message = err.to_string();
                self.models
                    .record_usage(&prepared.model, 0, elapsed, Some(message.as_str()))
                    .await
            }
        }
        prepared.reservation.settle(consumed).await;

        match err {
            CoreError::Cancelled => {}
            _ => error!(
                "Request {} for user {} failed on {}: {}",
                prepared.request.id, prepared.request.user_id, prepared.model, err
            ),
        }
    }

    /// Queue the exchange as conversation memories
    fn remember(&self, prepared: &Prepared, response: &str) {
        let request = &prepared.request;
        let mut memories = Vec::with_capacity(2);
        if let Some(Message { content, .. }) = request
            .messages
            .last()
            .filter(|m| m.role == Role::User)
        {
            memories.push(conversation_memory(request, content, "user"));
        }
        if !response.trim().is_empty() {
            memories.push(conversation_memory(request, response, "assistant"));
        }
        if memories.is_empty() {
            return;
        }

        let memory = self.memory.clone();
        let request_id = request.id.clone();
        self.writer.submit(async move {
            for item in memories {
                if let Err(e) = memory.store(item).await {
                    warn!("Failed to store memory for request {}: {}", request_id, e);
                }
            }
        });
    }
}

fn conversation_memory(request: &InferenceRequest, content: &str, speaker: &str) -> NewMemory {
    let mut memory = NewMemory::new(request.user_id.clone(), content, MemoryType::Conversation)
        .with_tags(["conversation", speaker]);
    memory.session_id = request.session_id.clone();
    memory
        .metadata
        .insert("request_id".to_string(), request.id.clone());
    memory
}

/// Send one chunk unless the request is cancelled first
async fn send_chunk(tx: &mpsc::Sender<StreamChunk>, token: &CancellationToken, chunk: StreamChunk) -> Result<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        sent = tx.send(chunk) => sent.map_err(|_| CoreError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendStream};
    use crate::orchestrator::models::{GenerationParams, RequestType};
    use crate::budget::{CompressionPolicy, ContextOptimizer, RatioEstimator, TokenEstimator};
    use crate::config::{BackendConfig, BudgetConfig, MemoryConfig, ModelConfig};
    use crate::memory::HashEmbedder;
    use crate::summarizer::TruncatingSummarizer;
    use async_trait::async_trait;
    use futures::stream;

    struct EchoBackend {
        delay: Duration,
    }

    #[async_trait]
    impl InferenceBackend for EchoBackend {
        async fn list_models(&self) -> std::result::Result<Vec<String>, BackendError> {
            Ok(vec!["chat-small".to_string()])
        }

        async fn warm(&self, _model: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn unload(&self, _model: &str) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn generate(&self, request: BackendRequest) -> std::result::Result<BackendResponse, BackendError> {
            tokio::time::sleep(self.delay).await;
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(BackendResponse {
                model: request.model,
                message: Some(Message::assistant(format!("echo: {}", last))),
                done: true,
                prompt_eval_count: Some(30),
                eval_count: Some(20),
                ..Default::default()
            })
        }

        async fn generate_stream(&self, request: BackendRequest) -> std::result::Result<BackendStream, BackendError> {
            let model = request.model.clone();
            let chunks: Vec<std::result::Result<BackendResponse, BackendError>> = (0..3)
                .map(|i| {
                    Ok(BackendResponse {
                        model: model.clone(),
                        message: Some(Message::assistant(format!("part{} ", i))),
                        done: i == 2,
                        eval_count: if i == 2 { Some(3) } else { None },
                        ..Default::default()
                    })
                })
                .collect();
            Ok(stream::iter(chunks).boxed())
        }
    }

    async fn orchestrator(delay: Duration, timeout_secs: u64) -> Arc<InferenceOrchestrator> {
        let backend: Arc<dyn InferenceBackend> = Arc::new(EchoBackend { delay });
        let orchestrator_config = OrchestratorConfig {
            request_timeout_secs: timeout_secs,
            ..Default::default()
        };
        let models = Arc::new(ModelManager::new(
            &[ModelConfig::new("chat-small", "chat", 1)],
            &BackendConfig::default(),
            &orchestrator_config,
            backend.clone(),
        ));
        models.ensure_loaded("chat-small").await.unwrap();

        let estimator: Arc<dyn TokenEstimator> = Arc::new(RatioEstimator::new(4.0));
        let optimizer = ContextOptimizer::new(
            estimator.clone(),
            Arc::new(TruncatingSummarizer::default()),
            CompressionPolicy::default(),
            100,
        );
        let budget = Arc::new(TokenBudgetManager::new(BudgetConfig::default(), estimator, optimizer));
        let memory = Arc::new(MemoryManager::new(
            MemoryConfig::default(),
            Arc::new(HashEmbedder::new(300)),
            Arc::new(TruncatingSummarizer::default()),
        ));

        Arc::new(InferenceOrchestrator::new(
            orchestrator_config,
            FeatureConfig::default(),
            models,
            budget,
            memory,
            backend,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_validation() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;

        let err = orchestrator
            .process(InferenceRequest::new("", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        let err = orchestrator
            .process(InferenceRequest::new("u1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        let params = GenerationParams {
            tools: vec!["search".to_string()],
            ..Default::default()
        };
        let err = orchestrator
            .process(InferenceRequest::new("u1", vec![Message::user("hi")]).with_params(params))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_system_prompt_only_is_valid() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let params = GenerationParams {
            system_prompt: Some("You are terse.".to_string()),
            ..Default::default()
        };
        let result = orchestrator
            .process(InferenceRequest::new("u1", vec![]).with_params(params))
            .await
            .unwrap();
        assert_eq!(result.content, "echo: You are terse.");
    }

    #[tokio::test]
    async fn test_process_completes_and_deregisters() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let request = InferenceRequest::new("u1", vec![Message::user("hello")]);
        let id = request.id.clone();

        let result = orchestrator.process(request).await.unwrap();
        assert_eq!(result.model, "chat-small");
        assert_eq!(result.usage, TokenUsage::new(30, 20));
        assert!(orchestrator.list_active().is_empty());
        assert_eq!(orchestrator.status(&id).unwrap().status, InferenceStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_suitable_model_refunds_reservation() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let request = InferenceRequest::new("u1", vec![Message::user("fn main() {}")])
            .with_type(RequestType::Code)
            .with_params(GenerationParams::with_max_tokens(100));

        let err = orchestrator.process(request).await.unwrap_err();
        assert!(matches!(err, CoreError::NoSuitableModel(_)));
        let usage = orchestrator.budget.user_usage("u1").await.unwrap();
        assert_eq!(usage.budget.used_tokens, 0);
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_and_touches_model() {
        let orchestrator = orchestrator(Duration::from_secs(3), 1).await;
        let before = orchestrator.models.record("chat-small").await.unwrap().last_used;
        let request = InferenceRequest::new("u1", vec![Message::user("slow")]);
        let id = request.id.clone();

        let err = orchestrator.process(request).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(orchestrator.status(&id).unwrap().status, InferenceStatus::Failed);
        let after = orchestrator.models.record("chat-small").await.unwrap().last_used;
        assert!(after > before);
        assert_eq!(orchestrator.models.stats("chat-small").await.unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_sync_request() {
        let orchestrator = orchestrator(Duration::from_secs(5), 30).await;
        let request = InferenceRequest::new("u1", vec![Message::user("wait")]);
        let id = request.id.clone();

        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.process(request).await })
        };
        for _ in 0..50 {
            if orchestrator.status(&id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.cancel(&id).unwrap();
        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert_eq!(orchestrator.status(&id).unwrap().status, InferenceStatus::Cancelled);
        assert!(matches!(orchestrator.cancel(&id), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_streaming_preserves_order() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let mut stream = orchestrator
            .process_streaming(InferenceRequest::new("u1", vec![Message::user("go")]))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.receiver.recv().await {
            chunks.push(chunk);
        }
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "part0 part1 part2 ");
        assert!(chunks.last().unwrap().done);
        assert_eq!(chunks.last().unwrap().tokens, 3);
        assert_eq!(
            orchestrator.status(&stream.request_id).unwrap().status,
            InferenceStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_memory_is_injected_after_system_messages() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        orchestrator
            .memory
            .store(NewMemory::new("u1", "The user deploys services with kubernetes", MemoryType::Fact))
            .await
            .unwrap();

        let request = InferenceRequest::new(
            "u1",
            vec![
                Message::system("Be helpful."),
                Message::user("The user deploys services with kubernetes"),
            ],
        );
        let prepared = orchestrator.prepare(request.clone()).await.unwrap();
        assert_eq!(prepared.memories_used, 0);

        let mut request = request;
        request.params.use_memory = true;
        let prepared = orchestrator.prepare(request).await.unwrap();
        assert_eq!(prepared.memories_used, 1);
        assert_eq!(prepared.messages.len(), 3);
        assert_eq!(prepared.messages[0].content, "Be helpful.");
        assert!(prepared.messages[1].content.starts_with(MEMORY_HEADER));
        assert!(prepared.messages[1].content.contains("kubernetes"));
    }

    async fn used_tokens(orchestrator: &InferenceOrchestrator, user: &str) -> u64 {
        orchestrator
            .budget
            .user_usage(user)
            .await
            .map(|u| u.budget.used_tokens)
            .unwrap_or(0)
    }

    async fn wait_for_used(orchestrator: &InferenceOrchestrator, user: &str, expected: u64) -> u64 {
        let mut used = used_tokens(orchestrator, user).await;
        for _ in 0..100 {
            if used == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            used = used_tokens(orchestrator, user).await;
        }
        used
    }

    #[tokio::test]
    async fn test_default_output_reservation_without_max_tokens() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let default_output = orchestrator.budget.config().default_output_tokens;

        let prepared = orchestrator
            .prepare(InferenceRequest::new("u1", vec![Message::user("hello there")]))
            .await
            .unwrap();
        assert_eq!(prepared.output_limit, default_output);
        assert_eq!(prepared.reservation.reserved, prepared.input_estimate + default_output);

        let request = orchestrator.backend_request(&prepared, false);
        assert_eq!(request.options["num_predict"], json!(default_output));

        let explicit = orchestrator
            .prepare(
                InferenceRequest::new("u2", vec![Message::user("hello there")])
                    .with_params(GenerationParams::with_max_tokens(64)),
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.backend_request(&explicit, false).options["num_predict"], json!(64));
    }

    #[tokio::test]
    async fn test_dropped_preparation_refunds_reservation() {
        let orchestrator = orchestrator(Duration::ZERO, 5).await;
        let request = InferenceRequest::new("u1", vec![Message::user("hello")])
            .with_params(GenerationParams::with_max_tokens(500));

        let prepared = orchestrator.prepare(request).await.unwrap();
        assert!(used_tokens(&orchestrator, "u1").await >= 500);

        drop(prepared);
        assert_eq!(wait_for_used(&orchestrator, "u1", 0).await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_refunds_reservation() {
        let orchestrator = orchestrator(Duration::from_secs(10), 30).await;
        let request = InferenceRequest::new("u1", vec![Message::user("wait")])
            .with_params(GenerationParams::with_max_tokens(500));
        let id = request.id.clone();

        let runner = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.process(request).await })
        };
        for _ in 0..50 {
            if orchestrator.status(&id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(used_tokens(&orchestrator, "u1").await >= 500);

        runner.abort();
        assert!(runner.await.unwrap_err().is_cancelled());

        assert_eq!(wait_for_used(&orchestrator, "u1", 0).await, 0);
        let snapshot = orchestrator.status(&id).unwrap();
        assert_eq!(snapshot.status, InferenceStatus::Cancelled);
        assert!(orchestrator.list_active().is_empty());
    }
}
