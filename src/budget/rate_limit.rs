//! Sliding one-minute rate window with escalating lockout

use super::models::{BlockReason, RateWindow};
use chrono::{DateTime, Duration, Utc};

/// Length of one rate window
pub fn window_length() -> Duration {
    Duration::seconds(60)
}

/// How violations turn into blocks
#[derive(Debug, Clone, Copy)]
pub struct BlockPolicy {
    /// Violations within one window before the user is blocked
    pub violation_threshold: u32,
    /// Cap on a single block, however many blocks came before it
    pub max_block_minutes: u32,
}

/// A request refused by the rate window
#[derive(Debug, Clone, PartialEq)]
pub struct RateRejection {
    pub reason: BlockReason,
    pub message: String,
    pub retry_at: DateTime<Utc>,
}

impl RateWindow {
    pub fn new(max_requests_per_minute: u32, max_tokens_per_minute: u64, now: DateTime<Utc>) -> Self {
        Self {
            max_requests_per_minute,
            max_tokens_per_minute,
            window_start: now,
            request_count: 0,
            token_count: 0,
            violation_count: 0,
            block_count: 0,
            blocked: false,
            blocked_until: None,
        }
    }

    /// Admit one request of `tokens` or explain why not.
    ///
    /// Rolling the window clears both the counts and the violation count. A
    /// block outlives window rollovers until `blocked_until` passes, and the
    /// number of past blocks survives both.
    pub fn admit(&mut self, tokens: u64, now: DateTime<Utc>, policy: BlockPolicy) -> Result<(), RateRejection> {
        if self.blocked {
            match self.blocked_until {
                Some(until) if now < until => {
                    return Err(RateRejection {
                        reason: BlockReason::Blocked,
                        message: format!("User temporarily blocked until {}", until.to_rfc3339()),
                        retry_at: until,
                    });
                }
                _ => self.lift_block(),
            }
        }

        if now - self.window_start >= window_length() {
            self.window_start = now;
            self.request_count = 0;
            self.token_count = 0;
            self.violation_count = 0;
        }

        if self.request_count + 1 > self.max_requests_per_minute {
            let message = format!(
                "Rate limit exceeded: {} requests per minute",
                self.max_requests_per_minute
            );
            return Err(self.violate(BlockReason::RequestRate, message, now, policy));
        }

        if self.token_count + tokens > self.max_tokens_per_minute {
            let message = format!(
                "Token rate limit exceeded: {} tokens per minute",
                self.max_tokens_per_minute
            );
            return Err(self.violate(BlockReason::TokenRate, message, now, policy));
        }

        self.request_count += 1;
        self.token_count += tokens;
        Ok(())
    }

    fn violate(
        &mut self,
        reason: BlockReason,
        message: String,
        now: DateTime<Utc>,
        policy: BlockPolicy,
    ) -> RateRejection {
        self.violation_count += 1;

        if self.violation_count >= policy.violation_threshold {
            // Each repeat block lasts one multiple of the violation count longer.
            let minutes = self
                .violation_count
                .saturating_mul(self.block_count.saturating_add(1))
                .min(policy.max_block_minutes.max(1));
            self.block_count = self.block_count.saturating_add(1);
            let until = now + Duration::minutes(minutes as i64);
            self.blocked = true;
            self.blocked_until = Some(until);
            return RateRejection {
                reason,
                message: format!("{}; blocked for {} minute(s)", message, minutes),
                retry_at: until,
            };
        }

        RateRejection {
            reason,
            message,
            retry_at: self.window_start + window_length(),
        }
    }

    /// End an expired block; the escalation history is kept
    fn lift_block(&mut self) {
        self.blocked = false;
        self.blocked_until = None;
        self.violation_count = 0;
    }

    /// Lift any block and forget past blocks
    pub fn clear_block(&mut self) {
        self.lift_block();
        self.block_count = 0;
    }
}
