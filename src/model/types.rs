//! Model lifecycle records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a model in the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Loading,
    Loaded,
    Error,
    Unloading,
}

/// One model known to the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub specialization: String,
    pub priority: i32,
    pub context_window: usize,
    pub status: ModelStatus,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    pub error: Option<String>,
}

impl ModelRecord {
    pub fn is_loaded(&self) -> bool {
        self.status == ModelStatus::Loaded
    }

    /// Whether the model has sat unused for longer than `threshold`
    pub fn is_idle(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.is_loaded() && now - self.last_used > threshold
    }
}

/// Cumulative usage for one model; survives unloads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub request_count: u64,
    pub total_tokens: u64,
    pub average_latency_ms: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ModelUsageStats {
    /// Fold one request into the counters
    pub fn record(&mut self, tokens: u64, latency: Duration, error: Option<&str>, now: DateTime<Utc>) {
        self.request_count += 1;
        self.total_tokens += tokens;
        self.last_used = Some(now);

        match error {
            Some(message) => {
                self.error_count += 1;
                self.last_error = Some(message.to_string());
            }
            None => {
                let latency_ms = latency.as_secs_f64() * 1000.0;
                let successes = (self.request_count - self.error_count) as f64;
                self.average_latency_ms += (latency_ms - self.average_latency_ms) / successes;
            }
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}
