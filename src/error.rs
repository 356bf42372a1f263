//! Error types shared across the inference core

use crate::backend::BackendError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the inference core to its callers
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited: {reason}")]
    RateLimited {
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },

    #[error("Budget exceeded: {reason}")]
    BudgetExceeded {
        reason: String,
        reset_at: DateTime<Utc>,
    },

    #[error("No suitable model for specialization '{0}'")]
    NoSuitableModel(String),

    #[error("Model {model} unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Memory error: {0}")]
    Memory(String),
}

impl CoreError {
    /// Whether a caller may retry the same request after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::RateLimited { .. } | CoreError::Timeout(_))
    }

    /// Earliest time at which a rejected request may be resubmitted
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CoreError::RateLimited { retry_at, .. } => *retry_at,
            CoreError::BudgetExceeded { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidRequest(_) => "invalid_request",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::BudgetExceeded { .. } => "budget_exceeded",
            CoreError::NoSuitableModel(_) => "no_suitable_model",
            CoreError::ModelUnavailable { .. } => "model_unavailable",
            CoreError::Backend(_) => "backend",
            CoreError::Timeout(_) => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::NotFound(_) => "not_found",
            CoreError::Configuration(_) => "configuration",
            CoreError::Memory(_) => "memory",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        let limited = CoreError::RateLimited {
            reason: "too many requests".to_string(),
            retry_at: None,
        };
        assert!(limited.is_retryable());
        assert!(CoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
        assert!(!CoreError::InvalidRequest("x".to_string()).is_retryable());
    }

    #[test]
    fn test_budget_exceeded_carries_reset_time() {
        let reset_at = Utc::now();
        let err = CoreError::BudgetExceeded {
            reason: "Token budget exceeded".to_string(),
            reset_at,
        };
        assert_eq!(err.retry_at(), Some(reset_at));
        assert_eq!(err.kind(), "budget_exceeded");
        assert!(err.to_string().contains("Token budget exceeded"));
    }

    #[test]
    fn test_backend_error_converts() {
        let err: CoreError = BackendError::Timeout("warm".to_string()).into();
        assert!(matches!(err, CoreError::Backend(_)));
    }
}
