//! Token budgets, rate limiting, estimation, and context compression

pub mod compression;
pub mod estimator;
pub mod manager;
pub mod models;
pub mod rate_limit;

pub use compression::{CompressedContext, CompressionPolicy, ContextOptimizer};
pub use estimator::{BpeEstimator, EncoderProfile, RatioEstimator, TokenEstimator};
pub use manager::TokenBudgetManager;
pub use models::{
    BlockReason, RateWindow, UsageCounters, UsageDecision, UsageRequest, UserBudget, UserUsage,
};
pub use rate_limit::{BlockPolicy, RateRejection};
