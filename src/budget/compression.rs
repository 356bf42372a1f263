//! Context compression: fit a conversation into a token ceiling
//!
//! The newest messages are kept verbatim and everything older is folded into
//! one synthetic system message holding a summary. The summary is always cut
//! to the space the kept messages leave, so the result fits whenever the
//! newest message alone does.

use super::estimator::TokenEstimator;
use crate::message::Message;
use crate::metrics::METRICS;
use crate::summarizer::{Summarizer, TruncatingSummarizer};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

const SUMMARY_PREFIX: &str = "Previous conversation summary: ";

/// Result of fitting a conversation into a token ceiling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedContext {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub original_tokens: usize,
    /// Number of older messages folded into the summary
    pub summarized_messages: usize,
}

impl CompressedContext {
    pub fn was_compressed(&self) -> bool {
        self.summarized_messages > 0
    }
}

/// Tail sizing for compression
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    pub tail_fraction: f64,
    pub min_tail: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            tail_fraction: 0.25,
            min_tail: 5,
        }
    }
}

/// Compresses conversations with a pluggable summarizer
pub struct ContextOptimizer {
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
    fallback: TruncatingSummarizer,
    policy: CompressionPolicy,
    cache: Cache<String, String>,
}

impl ContextOptimizer {
    pub fn new(
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Arc<dyn Summarizer>,
        policy: CompressionPolicy,
        cache_size: u64,
    ) -> Self {
        Self {
            estimator,
            summarizer,
            fallback: TruncatingSummarizer::default(),
            policy,
            cache: Cache::new(cache_size),
        }
    }

    /// Fit `messages` into `max_tokens` for `model`.
    ///
    /// Conversations already within the ceiling are returned unchanged.
    pub async fn optimize(&self, messages: Vec<Message>, max_tokens: usize, model: &str) -> CompressedContext {
        let original_tokens = self.estimator.estimate_messages(&messages, model);
        if original_tokens <= max_tokens || messages.len() < 2 {
            return CompressedContext {
                messages,
                estimated_tokens: original_tokens,
                original_tokens,
                summarized_messages: 0,
            };
        }

        let split = self.split_point(&messages, max_tokens, model);
        let (prefix, tail) = messages.split_at(split);

        let tail_tokens = self.estimator.estimate_messages(tail, model);
        let header_tokens = self.estimator.estimate(SUMMARY_PREFIX, model)
            + self.estimator.message_overhead(model);
        let summary_budget = max_tokens.saturating_sub(tail_tokens + header_tokens);

        let mut compressed: Vec<Message> = Vec::with_capacity(tail.len() + 1);
        if summary_budget > 0 {
            let summary = self.summarize_prefix(prefix, summary_budget, model).await;
            if !summary.is_empty() {
                compressed.push(Message::system(format!("{}{}", SUMMARY_PREFIX, summary)));
            }
        }
        compressed.extend_from_slice(tail);

        let mut estimated_tokens = self.estimator.estimate_messages(&compressed, model);
        if estimated_tokens > max_tokens && compressed.len() > tail.len() {
            // The estimator was not additive for this text; drop the summary.
            compressed.remove(0);
            estimated_tokens = tail_tokens;
        }

        METRICS.context_compressions.inc();
        debug!(
            "Compressed {} messages ({} tokens) to {} messages ({} tokens), ceiling {}",
            messages.len(),
            original_tokens,
            compressed.len(),
            estimated_tokens,
            max_tokens
        );

        CompressedContext {
            messages: compressed,
            estimated_tokens,
            original_tokens,
            summarized_messages: prefix.len(),
        }
    }

    /// Index of the first message kept verbatim
    fn split_point(&self, messages: &[Message], max_tokens: usize, model: &str) -> usize {
        let len = messages.len();
        let by_fraction = (len as f64 * self.policy.tail_fraction).ceil() as usize;
        let tail_len = by_fraction.max(self.policy.min_tail).min(len);

        let header_tokens = self.estimator.estimate(SUMMARY_PREFIX, model)
            + self.estimator.message_overhead(model);

        // Always fold at least one message, and always keep the newest one.
        let mut split = (len - tail_len).max(1);
        while split < len - 1
            && self.estimator.estimate_messages(&messages[split..], model) + header_tokens > max_tokens
        {
            split += 1;
        }
        split
    }

    async fn summarize_prefix(&self, prefix: &[Message], budget: usize, model: &str) -> String {
        let texts: Vec<String> = prefix
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();

        let key = cache_key(&texts, budget, model);
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }

        let summary = match self.summarizer.summarize(&texts, budget).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Summarizer failed, falling back to truncation: {}", e);
                self.fallback
                    .summarize(&texts, budget)
                    .await
                    .unwrap_or_default()
            }
        };

        let summary = self.fit_to_budget(summary, budget, model);
        self.cache.insert(key, summary.clone()).await;
        summary
    }

    /// Cut `text` until the estimator puts it within `budget` tokens
    fn fit_to_budget(&self, text: String, budget: usize, model: &str) -> String {
        let mut text = text;
        loop {
            let tokens = self.estimator.estimate(&text, model);
            if tokens <= budget || text.is_empty() {
                return text;
            }
            let chars = text.chars().count();
            let target = (chars * budget / tokens).min(chars - 1);
            text = text.chars().take(target).collect();
        }
    }
}

fn cache_key(texts: &[String], budget: usize, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(budget.to_le_bytes());
    for text in texts {
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::estimator::RatioEstimator;
    use crate::summarizer::SummarizerError;
    use async_trait::async_trait;

    fn optimizer() -> ContextOptimizer {
        ContextOptimizer::new(
            Arc::new(RatioEstimator::new(4.0)),
            Arc::new(TruncatingSummarizer::default()),
            CompressionPolicy::default(),
            100,
        )
    }

    fn conversation(turns: usize, words: usize) -> Vec<Message> {
        (0..turns)
            .map(|i| {
                let text = format!("turn {} {}", i, "lorem ipsum ".repeat(words));
                if i % 2 == 0 {
                    Message::user(text)
                } else {
                    Message::assistant(text)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_within_budget_is_identity() {
        let optimizer = optimizer();
        let messages = conversation(4, 2);
        let result = optimizer.optimize(messages.clone(), 10_000, "mistral").await;
        assert_eq!(result.messages, messages);
        assert!(!result.was_compressed());
    }

    #[tokio::test]
    async fn test_compressed_fits_ceiling() {
        let optimizer = optimizer();
        let messages = conversation(20, 20);
        let ceiling = 600;

        let result = optimizer.optimize(messages.clone(), ceiling, "mistral").await;
        assert!(result.original_tokens > ceiling);
        assert!(result.estimated_tokens <= ceiling);
        assert!(result.was_compressed());
        assert!(result.messages[0].is_system());
        assert!(result.messages[0].content.starts_with(SUMMARY_PREFIX));
        assert_eq!(result.messages.last(), messages.last());
    }

    #[tokio::test]
    async fn test_keeps_at_least_minimum_tail_when_it_fits() {
        let optimizer = optimizer();
        let messages = conversation(12, 20);
        let result = optimizer.optimize(messages.clone(), 500, "mistral").await;

        // Summary plus the five newest messages.
        assert_eq!(result.messages.len(), 6);
        assert_eq!(&result.messages[1..], &messages[7..]);
    }

    #[tokio::test]
    async fn test_tail_shrinks_for_tight_ceiling() {
        let optimizer = optimizer();
        let messages = conversation(10, 30);
        let ceiling = 120;

        let result = optimizer.optimize(messages.clone(), ceiling, "mistral").await;
        assert!(result.estimated_tokens <= ceiling);
        assert_eq!(result.messages.last(), messages.last());
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _texts: &[String], _max_tokens: usize) -> Result<String, SummarizerError> {
            Err(SummarizerError::EmptySummary)
        }
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back() {
        let optimizer = ContextOptimizer::new(
            Arc::new(RatioEstimator::new(4.0)),
            Arc::new(FailingSummarizer),
            CompressionPolicy::default(),
            100,
        );
        let result = optimizer.optimize(conversation(20, 20), 600, "mistral").await;
        assert!(result.estimated_tokens <= 600);
        assert!(result.messages[0].content.starts_with(SUMMARY_PREFIX));
    }
}
