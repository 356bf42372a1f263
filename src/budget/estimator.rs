//! Token estimation for budgeting and context sizing

use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens `model` would see for `text`
    fn estimate(&self, text: &str, model: &str) -> usize;

    /// Fixed cost the model's chat template adds per message
    fn message_overhead(&self, _model: &str) -> usize {
        0
    }

    /// Estimate a whole conversation
    fn estimate_messages(&self, messages: &[Message], model: &str) -> usize {
        let overhead = self.message_overhead(model);
        messages
            .iter()
            .map(|m| self.estimate(&m.content, model) + overhead)
            .sum()
    }
}

/// Characters-per-token ratio and template overhead for one model family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderProfile {
    pub chars_per_token: f64,
    pub message_overhead: usize,
    pub max_context: usize,
}

/// Ratio estimator with per-model profiles and a global fallback.
///
/// Model tags (`llama3.2:latest`) are ignored when matching profiles.
pub struct RatioEstimator {
    profiles: HashMap<String, EncoderProfile>,
    fallback_chars_per_token: f64,
}

impl RatioEstimator {
    pub fn new(fallback_chars_per_token: f64) -> Self {
        Self {
            profiles: HashMap::new(),
            fallback_chars_per_token,
        }
    }

    /// Estimator preloaded with the built-in model profiles
    pub fn with_builtin_profiles(fallback_chars_per_token: f64) -> Self {
        Self::new(fallback_chars_per_token)
            .with_profile(
                "llama3.2",
                EncoderProfile {
                    chars_per_token: 3.8,
                    message_overhead: 5,
                    max_context: 8192,
                },
            )
            .with_profile(
                "codellama",
                EncoderProfile {
                    chars_per_token: 4.2,
                    message_overhead: 3,
                    max_context: 4096,
                },
            )
    }

    pub fn with_profile(mut self, model: impl Into<String>, profile: EncoderProfile) -> Self {
        self.profiles.insert(model.into(), profile);
        self
    }

    pub fn profile(&self, model: &str) -> Option<&EncoderProfile> {
        let family = model.split(':').next().unwrap_or(model);
        self.profiles.get(family)
    }
}

impl TokenEstimator for RatioEstimator {
    fn estimate(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let ratio = self
            .profile(model)
            .map(|p| p.chars_per_token)
            .unwrap_or(self.fallback_chars_per_token);
        (text.chars().count() as f64 / ratio).ceil() as usize
    }

    fn message_overhead(&self, model: &str) -> usize {
        self.profile(model).map(|p| p.message_overhead).unwrap_or(0)
    }
}

/// cl100k BPE estimator; model-agnostic
pub struct BpeEstimator {
    bpe: Arc<CoreBPE>,
    message_overhead: usize,
}

impl BpeEstimator {
    pub fn new() -> Result<Self, String> {
        let bpe = cl100k_base().map_err(|e| e.to_string())?;
        Ok(Self {
            bpe: Arc::new(bpe),
            message_overhead: 4,
        })
    }
}

impl TokenEstimator for BpeEstimator {
    fn estimate(&self, text: &str, _model: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn message_overhead(&self, _model: &str) -> usize {
        self.message_overhead
    }
}
