//! Token budget manager
//!
//! Admission control per user: a one-minute rate window with escalating
//! blocks, then a token quota that resets on an interval. The manager's
//! lock is held across each check-and-charge so concurrent requests from one
//! user cannot both pass a nearly exhausted budget.

use super::compression::{CompressedContext, ContextOptimizer};
use super::estimator::TokenEstimator;
use super::models::{
    BlockReason, RateWindow, UsageCounters, UsageDecision, UsageRequest, UserBudget, UserUsage,
};
use super::rate_limit::BlockPolicy;
use crate::config::BudgetConfig;
use crate::error::{CoreError, Result};
use crate::message::Message;
use crate::metrics::METRICS;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct BudgetState {
    budgets: HashMap<String, UserBudget>,
    windows: HashMap<String, RateWindow>,
    counters: HashMap<String, UsageCounters>,
}

/// Token budget manager
pub struct TokenBudgetManager {
    config: BudgetConfig,
    state: RwLock<BudgetState>,
    estimator: Arc<dyn TokenEstimator>,
    optimizer: ContextOptimizer,
}

impl TokenBudgetManager {
    pub fn new(config: BudgetConfig, estimator: Arc<dyn TokenEstimator>, optimizer: ContextOptimizer) -> Self {
        Self {
            config,
            state: RwLock::new(BudgetState::default()),
            estimator,
            optimizer,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn policy(&self) -> BlockPolicy {
        BlockPolicy {
            violation_threshold: self.config.violation_threshold,
            max_block_minutes: self.config.max_block_minutes,
        }
    }

    /// Check and charge one request against the user's rate window and quota
    pub async fn check_usage(&self, request: &UsageRequest) -> UsageDecision {
        self.check_usage_at(request, Utc::now()).await
    }

    /// [`check_usage`](Self::check_usage) at an explicit instant
    pub async fn check_usage_at(&self, request: &UsageRequest, now: DateTime<Utc>) -> UsageDecision {
        let policy = self.policy();
        let tokens = request.total_tokens();

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let budget = state
            .budgets
            .entry(request.user_id.clone())
            .or_insert_with(|| UserBudget::new(&request.user_id, &self.config, now));
        if budget.needs_reset(now) {
            budget.reset(now, self.config.reset_interval());
        }

        let window = state.windows.entry(request.user_id.clone()).or_insert_with(|| {
            RateWindow::new(
                self.config.max_requests_per_minute,
                self.config.tokens_per_minute(),
                now,
            )
        });

        if let Err(rejection) = window.admit(tokens, now, policy) {
            warn!("Rate limit for user {}: {}", request.user_id, rejection.message);
            METRICS.record_rejection(rejection.reason.as_str());
            return UsageDecision {
                allowed: false,
                remaining: budget.remaining(),
                used: budget.used_tokens,
                reset_at: budget.reset_at,
                warning: None,
                block_reason: Some(rejection.reason),
                message: Some(rejection.message),
                retry_at: Some(rejection.retry_at),
                reserved: 0,
            };
        }

        let mut reserved = tokens;
        let mut warning = None;

        if budget.unlimited {
            reserved = 0;
        } else {
            if budget.used_tokens + tokens > budget.total_budget && !budget.overage_allowed {
                let message = format!(
                    "Token budget exceeded: {} used + {} requested > {} allowed",
                    budget.used_tokens, tokens, budget.total_budget
                );
                warn!("User {}: {}", request.user_id, message);
                METRICS.record_rejection(BlockReason::BudgetExceeded.as_str());
                return UsageDecision {
                    allowed: false,
                    remaining: budget.remaining(),
                    used: budget.used_tokens,
                    reset_at: budget.reset_at,
                    warning: None,
                    block_reason: Some(BlockReason::BudgetExceeded),
                    message: Some(message),
                    retry_at: Some(budget.reset_at),
                    reserved: 0,
                };
            }

            budget.used_tokens += tokens;

            let warned_recently = budget
                .last_warning_at
                .map(|at| now - at < Duration::hours(1))
                .unwrap_or(false);
            if budget.usage_fraction() >= budget.warning_threshold && !warned_recently {
                let text = format!(
                    "Warning: {:.1}% of token budget used",
                    budget.usage_fraction() * 100.0
                );
                info!("User {}: {}", request.user_id, text);
                budget.last_warning_at = Some(now);
                METRICS.budget_warnings.inc();
                warning = Some(text);
            }
        }

        state
            .counters
            .entry(request.user_id.clone())
            .or_default()
            .record(&request.model, request.session_id.as_deref(), tokens, now);

        debug!(
            "Admitted {} tokens for user {} on {}",
            tokens, request.user_id, request.model
        );

        UsageDecision {
            allowed: true,
            remaining: budget.remaining(),
            used: budget.used_tokens,
            reset_at: budget.reset_at,
            warning,
            block_reason: None,
            message: None,
            retry_at: None,
            reserved,
        }
    }

    /// Replace a reservation with the tokens actually consumed.
    ///
    /// Without overage the resulting usage never exceeds the total budget.
    pub async fn settle_usage(&self, request: &UsageRequest, reserved: u64, actual: u64) {
        let now = Utc::now();
        let delta = actual as i64 - request.total_tokens() as i64;

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(budget) = state.budgets.get_mut(&request.user_id) {
            if !budget.unlimited {
                let base = budget.used_tokens.saturating_sub(reserved);
                let mut charged = base + actual;
                if !budget.overage_allowed && charged > budget.total_budget {
                    // Never push a capped user past the quota after admission.
                    charged = budget.total_budget.max(base);
                    debug!(
                        "Charge for user {} capped at {} ({} consumed)",
                        request.user_id, charged, actual
                    );
                }
                budget.used_tokens = charged;
            }
        }
        if let Some(counters) = state.counters.get_mut(&request.user_id) {
            counters.adjust(&request.model, request.session_id.as_deref(), delta, now);
        }
    }

    /// Refund a reservation for a request that produced nothing
    pub async fn release_usage(&self, request: &UsageRequest, reserved: u64) {
        self.settle_usage(request, reserved, 0).await;
    }

    pub fn estimate_tokens(&self, text: &str, model: &str) -> usize {
        self.estimator.estimate(text, model)
    }

    pub fn estimate_messages(&self, messages: &[Message], model: &str) -> usize {
        self.estimator.estimate_messages(messages, model)
    }

    /// Fit a conversation into `max_tokens`, summarizing older turns if needed
    pub async fn optimize_context(&self, messages: Vec<Message>, max_tokens: usize, model: &str) -> CompressedContext {
        self.optimizer.optimize(messages, max_tokens, model).await
    }

    /// Override a user's quota settings
    pub async fn set_user_budget(&self, user_id: &str, total_budget: u64, unlimited: bool, overage_allowed: bool) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let budget = state
            .budgets
            .entry(user_id.to_string())
            .or_insert_with(|| UserBudget::new(user_id, &self.config, now));
        budget.total_budget = total_budget;
        budget.daily_limit = total_budget;
        budget.hourly_limit = total_budget / 24;
        budget.unlimited = unlimited;
        budget.overage_allowed = overage_allowed;
        info!("Budget for user {} set to {} (unlimited: {})", user_id, total_budget, unlimited);
    }

    /// Zero a user's usage and lift any block
    pub async fn reset_user_budget(&self, user_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let budget = state
            .budgets
            .get_mut(user_id)
            .ok_or_else(|| CoreError::NotFound(format!("budget for user {}", user_id)))?;
        budget.reset(now, self.config.reset_interval());

        if let Some(window) = state.windows.get_mut(user_id) {
            window.clear_block();
        }
        Ok(())
    }

    pub async fn user_usage(&self, user_id: &str) -> Option<UserUsage> {
        let state = self.state.read().await;
        let budget = state.budgets.get(user_id)?.clone();
        Some(UserUsage {
            budget,
            counters: state.counters.get(user_id).cloned().unwrap_or_default(),
            rate_window: state.windows.get(user_id).cloned(),
        })
    }

    /// Reset every budget whose `reset_at` has passed. Returns how many reset.
    pub async fn run_resets(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let interval = self.config.reset_interval();

        let mut reset = 0;
        for (user_id, budget) in state.budgets.iter_mut() {
            if budget.needs_reset(now) {
                budget.reset(now, interval);
                if let Some(window) = state.windows.get_mut(user_id) {
                    window.clear_block();
                }
                reset += 1;
            }
        }

        if reset > 0 {
            info!("Reset {} user budget(s)", reset);
        }
        reset
    }

    /// Run the periodic budget reset until `token` is cancelled
    pub fn spawn_reset_task(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reset_check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Budget reset task stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_resets(Utc::now()).await;
                    }
                }
            }
        })
    }
}
