//! Budget, rate window, and usage accounting types

use crate::config::BudgetConfig;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const HOURLY_BUCKETS: usize = 48;
const DAILY_BUCKETS: usize = 31;

/// Per-user token quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBudget {
    pub user_id: String,
    pub total_budget: u64,
    /// Reported only; the quota enforced is `total_budget`
    pub daily_limit: u64,
    pub hourly_limit: u64,
    pub used_tokens: u64,
    pub reset_at: DateTime<Utc>,
    pub unlimited: bool,
    pub overage_allowed: bool,
    pub warning_threshold: f64,
    pub last_warning_at: Option<DateTime<Utc>>,
}

impl UserBudget {
    pub fn new(user_id: &str, config: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let total = config.token_budget_per_user;
        Self {
            user_id: user_id.to_string(),
            total_budget: total,
            daily_limit: total,
            hourly_limit: total / 24,
            used_tokens: 0,
            reset_at: now + config.reset_interval(),
            unlimited: config.unlimited_users.iter().any(|u| u == user_id),
            overage_allowed: false,
            warning_threshold: config.warning_threshold,
            last_warning_at: None,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        if self.unlimited {
            None
        } else {
            Some(self.total_budget.saturating_sub(self.used_tokens))
        }
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.total_budget == 0 {
            return 1.0;
        }
        self.used_tokens as f64 / self.total_budget as f64
    }

    pub fn needs_reset(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    pub fn reset(&mut self, now: DateTime<Utc>, interval: chrono::Duration) {
        self.used_tokens = 0;
        self.reset_at = now + interval;
        self.last_warning_at = None;
    }
}

/// One-minute rolling request/token window with escalating blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub max_requests_per_minute: u32,
    pub max_tokens_per_minute: u64,
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub token_count: u64,
    pub violation_count: u32,
    /// Blocks imposed since the last budget reset; each one lasts longer
    #[serde(default)]
    pub block_count: u32,
    pub blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Why a request was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RequestRate,
    TokenRate,
    Blocked,
    BudgetExceeded,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::RequestRate => "request_rate",
            BlockReason::TokenRate => "token_rate",
            BlockReason::Blocked => "blocked",
            BlockReason::BudgetExceeded => "budget_exceeded",
        }
    }
}

/// Admission request for one inference call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRequest {
    pub user_id: String,
    pub model: String,
    pub session_id: Option<String>,
    pub input_tokens: u64,
    /// Upper bound on completion tokens for the call
    pub output_tokens: u64,
}

impl UsageRequest {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageDecision {
    pub allowed: bool,
    /// `None` for unlimited users
    pub remaining: Option<u64>,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
    pub warning: Option<String>,
    pub block_reason: Option<BlockReason>,
    pub message: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
    /// Tokens charged for this request; settle or release them later
    pub reserved: u64,
}

impl UsageDecision {
    /// Convert a rejection into the caller-facing error
    pub fn to_error(&self) -> Option<CoreError> {
        if self.allowed {
            return None;
        }

        let reason = self
            .message
            .clone()
            .unwrap_or_else(|| "request not admitted".to_string());

        Some(match self.block_reason {
            Some(BlockReason::BudgetExceeded) => CoreError::BudgetExceeded {
                reason,
                reset_at: self.reset_at,
            },
            _ => CoreError::RateLimited {
                reason,
                retry_at: self.retry_at,
            },
        })
    }
}

/// Token usage broken down by model, session, hour, and day
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub by_model: HashMap<String, u64>,
    pub by_session: HashMap<String, u64>,
    pub hourly: BTreeMap<String, u64>,
    pub daily: BTreeMap<String, u64>,
}

fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn trim_oldest(buckets: &mut BTreeMap<String, u64>, keep: usize) {
    while buckets.len() > keep {
        let Some(oldest) = buckets.keys().next().cloned() else {
            break;
        };
        buckets.remove(&oldest);
    }
}

fn apply_delta(value: &mut u64, delta: i64) {
    if delta >= 0 {
        *value += delta as u64;
    } else {
        *value = value.saturating_sub(delta.unsigned_abs());
    }
}

impl UsageCounters {
    pub fn record(&mut self, model: &str, session_id: Option<&str>, tokens: u64, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.adjust(model, session_id, tokens as i64, now);
    }

    /// Apply a token correction without counting a new request
    pub fn adjust(&mut self, model: &str, session_id: Option<&str>, delta: i64, now: DateTime<Utc>) {
        apply_delta(&mut self.total_tokens, delta);
        apply_delta(self.by_model.entry(model.to_string()).or_default(), delta);
        if let Some(session) = session_id {
            apply_delta(self.by_session.entry(session.to_string()).or_default(), delta);
        }
        apply_delta(self.hourly.entry(hour_key(now)).or_default(), delta);
        apply_delta(self.daily.entry(day_key(now)).or_default(), delta);

        trim_oldest(&mut self.hourly, HOURLY_BUCKETS);
        trim_oldest(&mut self.daily, DAILY_BUCKETS);
    }

    pub fn tokens_this_hour(&self, now: DateTime<Utc>) -> u64 {
        self.hourly.get(&hour_key(now)).copied().unwrap_or(0)
    }
}

/// Snapshot of a user's accounting state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUsage {
    pub budget: UserBudget,
    pub counters: UsageCounters,
    pub rate_window: Option<RateWindow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_budget_from_config() {
        let config = BudgetConfig {
            token_budget_per_user: 2400,
            unlimited_users: vec!["admin".to_string()],
            ..Default::default()
        };
        let now = Utc::now();

        let budget = UserBudget::new("alice", &config, now);
        assert_eq!(budget.hourly_limit, 100);
        assert_eq!(budget.remaining(), Some(2400));
        assert_eq!(budget.reset_at, now + chrono::Duration::hours(24));

        let admin = UserBudget::new("admin", &config, now);
        assert!(admin.unlimited);
        assert_eq!(admin.remaining(), None);
    }

    #[test]
    fn test_counters_bucket_by_hour_and_day() {
        let mut counters = UsageCounters::default();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 11, 5, 0).unwrap();

        counters.record("llama3.2", Some("s1"), 100, t1);
        counters.record("codellama", Some("s1"), 50, t2);
        counters.adjust("codellama", Some("s1"), -20, t2);

        assert_eq!(counters.total_requests, 2);
        assert_eq!(counters.total_tokens, 130);
        assert_eq!(counters.by_model["codellama"], 30);
        assert_eq!(counters.by_session["s1"], 130);
        assert_eq!(counters.hourly["2024-05-01-10"], 100);
        assert_eq!(counters.daily["2024-05-01"], 130);
        assert_eq!(counters.tokens_this_hour(t2), 30);
    }

    #[test]
    fn test_hourly_buckets_are_bounded() {
        let mut counters = UsageCounters::default();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        for hour in 0..60 {
            counters.record("m", None, 1, start + chrono::Duration::hours(hour));
        }
        assert_eq!(counters.hourly.len(), HOURLY_BUCKETS);
        assert!(!counters.hourly.contains_key("2024-05-01-00"));
    }

    #[test]
    fn test_rejection_maps_to_error() {
        let reset_at = Utc::now();
        let decision = UsageDecision {
            allowed: false,
            remaining: Some(10),
            used: 990,
            reset_at,
            warning: None,
            block_reason: Some(BlockReason::BudgetExceeded),
            message: Some("Token budget exceeded".to_string()),
            retry_at: None,
            reserved: 0,
        };
        assert!(matches!(
            decision.to_error(),
            Some(CoreError::BudgetExceeded { .. })
        ));
    }
}
