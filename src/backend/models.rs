//! Wire types for the backend generation API

use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A generation call, either chat-style or raw prompt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendRequest {
    pub model: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,

    /// Raw completion prompt; selects the generate endpoint when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    pub stream: bool,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
}

impl BackendRequest {
    pub fn chat(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Whether this call goes to the raw prompt endpoint
    pub fn is_prompt(&self) -> bool {
        self.prompt.is_some()
    }
}

/// Full or partial backend response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendResponse {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub created_at: Option<String>,

    /// Chat endpoint payload
    #[serde(default)]
    pub message: Option<Message>,

    /// Generate endpoint payload
    #[serde(default)]
    pub response: Option<String>,

    #[serde(default)]
    pub done: bool,

    #[serde(default)]
    pub done_reason: Option<String>,

    #[serde(default)]
    pub prompt_eval_count: Option<u64>,

    #[serde(default)]
    pub eval_count: Option<u64>,

    /// Durations are nanoseconds
    #[serde(default)]
    pub total_duration: Option<u64>,

    #[serde(default)]
    pub load_duration: Option<u64>,

    #[serde(default)]
    pub prompt_eval_duration: Option<u64>,

    #[serde(default)]
    pub eval_duration: Option<u64>,

    /// Set by the engine when a stream fails midway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendResponse {
    /// Generated text regardless of which endpoint produced it
    pub fn content(&self) -> &str {
        if let Some(message) = &self.message {
            return &message.content;
        }
        self.response.as_deref().unwrap_or("")
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_eval_count.unwrap_or(0)
    }

    pub fn completion_tokens(&self) -> u64 {
        self.eval_count.unwrap_or(0)
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        match (self.eval_count, self.eval_duration) {
            (Some(count), Some(nanos)) if nanos > 0 => Some(count as f64 / (nanos as f64 / 1e9)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_omits_empty_fields() {
        let request = BackendRequest::chat("llama3.2", vec![Message::user("hello")]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "llama3.2");
        assert_eq!(value["stream"], false);
        assert!(value.get("prompt").is_none());
        assert!(value.get("options").is_none());
    }

    #[test]
    fn test_response_content_from_either_endpoint() {
        let chat: BackendResponse = serde_json::from_value(json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "hi there"},
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 40,
            "eval_duration": 2_000_000_000u64
        }))
        .unwrap();
        assert_eq!(chat.content(), "hi there");
        assert_eq!(chat.tokens_per_second(), Some(20.0));

        let generate: BackendResponse =
            serde_json::from_value(json!({"model": "codellama", "response": "fn main() {}", "done": false}))
                .unwrap();
        assert_eq!(generate.content(), "fn main() {}");
        assert_eq!(generate.completion_tokens(), 0);
        assert_eq!(generate.tokens_per_second(), None);
    }
}
