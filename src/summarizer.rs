//! Summarization strategies for context compression and memory consolidation

use crate::backend::{BackendRequest, InferenceBackend};
use crate::message::Message;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Summarizer trait for different summarization strategies
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a list of text segments into at most roughly `max_tokens`
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError>;
}

/// Keeps a leading fraction of the joined text.
///
/// Output is capped both by `keep_ratio` of the input and by `max_tokens`
/// converted to characters, and marked with a trailing ellipsis when cut.
pub struct TruncatingSummarizer {
    keep_ratio: f64,
    chars_per_token: f64,
}

impl TruncatingSummarizer {
    pub fn new(keep_ratio: f64, chars_per_token: f64) -> Self {
        Self {
            keep_ratio,
            chars_per_token,
        }
    }
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self::new(0.25, 4.0)
    }
}

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        let joined = texts.join("\n");
        let total_chars = joined.chars().count();

        let by_ratio = (total_chars as f64 * self.keep_ratio).ceil() as usize;
        let by_budget = (max_tokens as f64 * self.chars_per_token).floor() as usize;
        let keep = by_ratio.min(by_budget.saturating_sub(3));

        if keep >= total_chars {
            return Ok(joined);
        }

        let mut summary: String = joined.chars().take(keep).collect();
        summary.push_str("...");
        Ok(summary)
    }
}

/// Asks a backend model to write the summary
pub struct BackendSummarizer {
    backend: Arc<dyn InferenceBackend>,
    model: String,
    timeout: Duration,
}

impl BackendSummarizer {
    pub fn new(backend: Arc<dyn InferenceBackend>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout,
        }
    }

    fn build_prompt(&self, texts: &[String], max_tokens: usize) -> String {
        let combined = texts.join("\n\n---\n\n");
        format!(
            "Summarize the following conversation into a short brief. \
            Keep facts, decisions, and open questions. \
            Stay under {} tokens.\n\n{}",
            max_tokens, combined
        )
    }
}

#[async_trait]
impl Summarizer for BackendSummarizer {
    async fn summarize(&self, texts: &[String], max_tokens: usize) -> Result<String, SummarizerError> {
        if texts.is_empty() {
            return Ok(String::new());
        }

        debug!("Summarizing {} segments with {}, target {} tokens", texts.len(), self.model, max_tokens);

        let mut request = BackendRequest::chat(
            self.model.clone(),
            vec![
                Message::system("You are a concise summarizer. Extract key information and compress it."),
                Message::user(self.build_prompt(texts, max_tokens)),
            ],
        );
        request.options.insert("temperature".to_string(), json!(0.3));
        request.options.insert("num_predict".to_string(), json!(max_tokens));

        let response = tokio::time::timeout(self.timeout, self.backend.generate(request))
            .await
            .map_err(|_| SummarizerError::Timeout(self.timeout))?
            .map_err(|e| SummarizerError::Backend(e.to_string()))?;

        let summary = response.content().trim().to_string();
        if summary.is_empty() {
            warn!("Summarizer model {} returned an empty summary", self.model);
            return Err(SummarizerError::EmptySummary);
        }
        Ok(summary)
    }
}

/// Summarizer errors
#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Summarization timed out after {0:?}")]
    Timeout(Duration),

    #[error("Summarizer returned an empty summary")]
    EmptySummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_truncating_keeps_short_text() {
        let summarizer = TruncatingSummarizer::new(1.0, 4.0);
        let texts = vec!["user: hi".to_string(), "assistant: hello".to_string()];
        let summary = summarizer.summarize(&texts, 100).await.unwrap();
        assert_eq!(summary, "user: hi\nassistant: hello");
    }

    #[tokio::test]
    async fn test_truncating_keeps_leading_quarter() {
        let summarizer = TruncatingSummarizer::default();
        let texts = vec!["a".repeat(400)];
        let summary = summarizer.summarize(&texts, 1000).await.unwrap();
        assert_eq!(summary.len(), 100 + 3);
        assert!(summary.ends_with("..."));
    }

    #[tokio::test]
    async fn test_truncating_respects_token_cap() {
        let summarizer = TruncatingSummarizer::default();
        let texts = vec!["word ".repeat(2000)];
        let summary = summarizer.summarize(&texts, 10).await.unwrap();
        assert!(summary.chars().count() <= 40);
    }

    #[tokio::test]
    async fn test_truncating_is_char_boundary_safe() {
        let summarizer = TruncatingSummarizer::new(0.5, 4.0);
        let texts = vec!["héllo wörld ünïcode".to_string()];
        let summary = summarizer.summarize(&texts, 100).await.unwrap();
        assert!(summary.ends_with("..."));
    }
}
