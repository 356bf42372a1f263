//! Request, result, and stream types for the inference pipeline

use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use uuid::Uuid;

/// Kind of work a request asks for; drives model routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    #[default]
    Chat,
    Completion,
    Code,
    Reasoning,
    Analysis,
    Summary,
    Translate,
}

impl RequestType {
    /// Model specialization used when no model is named
    pub fn specialization(&self) -> &'static str {
        match self {
            RequestType::Code => "code",
            RequestType::Reasoning => "reasoning",
            RequestType::Analysis => "analysis",
            _ => "chat",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Chat => "chat",
            RequestType::Completion => "completion",
            RequestType::Code => "code",
            RequestType::Reasoning => "reasoning",
            RequestType::Analysis => "analysis",
            RequestType::Summary => "summary",
            RequestType::Translate => "translate",
        }
    }
}

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceStatus {
    Pending,
    Processing,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl InferenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InferenceStatus::Completed | InferenceStatus::Failed | InferenceStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceStatus::Pending => "pending",
            InferenceStatus::Processing => "processing",
            InferenceStatus::Streaming => "streaming",
            InferenceStatus::Completed => "completed",
            InferenceStatus::Failed => "failed",
            InferenceStatus::Cancelled => "cancelled",
        }
    }
}

/// Generation parameters.
///
/// Typed fields cover what the pipeline reasons about; `extras` passes
/// backend-specific options through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub use_memory: bool,
    /// Memories to inject; the orchestrator default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_depth: Option<usize>,
    #[serde(default)]
    pub compress_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

impl GenerationParams {
    /// Defaults with a completion cap
    pub fn with_max_tokens(max_tokens: u64) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }

    /// Backend option map; extras override typed fields with the same key
    pub fn to_backend_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        if let Some(v) = self.temperature {
            options.insert("temperature".to_string(), json!(v));
        }
        if let Some(v) = self.top_k {
            options.insert("top_k".to_string(), json!(v));
        }
        if let Some(v) = self.top_p {
            options.insert("top_p".to_string(), json!(v));
        }
        if let Some(v) = self.repeat_penalty {
            options.insert("repeat_penalty".to_string(), json!(v));
        }
        if let Some(v) = self.seed {
            options.insert("seed".to_string(), json!(v));
        }
        if let Some(v) = self.max_tokens {
            options.insert("num_predict".to_string(), json!(v));
        }
        if !self.stop.is_empty() {
            options.insert("stop".to_string(), json!(self.stop));
        }
        for (key, value) in &self.extras {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}

/// A generation request as submitted by the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Explicit model; routed by request type when absent
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub request_type: RequestType,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub params: GenerationParams,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl InferenceRequest {
    pub fn new(user_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: new_request_id(),
            user_id: user_id.into(),
            session_id: None,
            model: None,
            request_type: RequestType::default(),
            messages,
            params: GenerationParams::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

/// Token accounting for a finished request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Timing reported by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub processing_time_ms: u64,
    pub load_time_ms: u64,
    pub tokens_per_second: Option<f64>,
}

/// Outcome of a synchronous request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub request_id: String,
    pub content: String,
    pub model: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
    pub duration: Duration,
    pub performance: PerformanceStats,
    /// Budget warning raised at admission
    pub warning: Option<String>,
    pub memories_used: usize,
    pub compressed: bool,
}

/// One piece of a streamed response.
///
/// The final chunk has `done` set; a failed stream ends with a chunk that
/// carries `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    /// Output tokens produced so far
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    pub fn failure(error: impl Into<String>, tokens: u64) -> Self {
        Self {
            content: String::new(),
            done: true,
            tokens,
            error: Some(error.into()),
        }
    }
}

/// Point-in-time view of a request for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSnapshot {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub model: String,
    pub request_type: RequestType,
    pub status: InferenceStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specialization_mapping() {
        assert_eq!(RequestType::Code.specialization(), "code");
        assert_eq!(RequestType::Reasoning.specialization(), "reasoning");
        assert_eq!(RequestType::Analysis.specialization(), "analysis");
        assert_eq!(RequestType::Summary.specialization(), "chat");
        assert_eq!(RequestType::default().specialization(), "chat");
    }

    #[test]
    fn test_backend_options() {
        let mut params = GenerationParams {
            temperature: Some(0.2),
            top_k: Some(40),
            max_tokens: Some(128),
            stop: vec!["###".to_string()],
            ..Default::default()
        };
        params.extras.insert("num_ctx".to_string(), json!(8192));
        params.extras.insert("temperature".to_string(), json!(0.9));

        let options = params.to_backend_options();
        assert_eq!(options["top_k"], json!(40));
        assert_eq!(options["num_predict"], json!(128));
        assert_eq!(options["stop"], json!(["###"]));
        assert_eq!(options["num_ctx"], json!(8192));
        assert_eq!(options["temperature"], json!(0.9));
        assert!(!options.contains_key("seed"));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: InferenceRequest = serde_json::from_value(json!({
            "user_id": "u1",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert!(!request.id.is_empty());
        assert_eq!(request.request_type, RequestType::Chat);
        assert!(!request.params.use_memory);
    }

    #[test]
    fn test_terminal_states() {
        assert!(InferenceStatus::Cancelled.is_terminal());
        assert!(!InferenceStatus::Streaming.is_terminal());
    }
}
