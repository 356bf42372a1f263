//! Per-model circuit breaker for backend calls

use super::BackendError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// One probe call is allowed through
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: usize,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_started: None,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probe_started = None;
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks consecutive failures per key (a model name) and short-circuits
/// calls to a key whose backend keeps failing
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit or reject a call for `key`.
    ///
    /// An open breaker whose reset timeout elapsed moves to half-open and lets
    /// exactly one probe through until that probe reports back. A probe that
    /// never reports (its caller was dropped) is replaced after another reset
    /// timeout.
    pub fn check(&self, key: &str) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = match entries.get_mut(key) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_started = Some(now);
                    Ok(())
                } else {
                    Err(BackendError::CircuitOpen(key.to_string()))
                }
            }
            BreakerState::HalfOpen => match entry.probe_started {
                Some(started) if now.duration_since(started) < self.config.reset_timeout => {
                    Err(BackendError::CircuitOpen(key.to_string()))
                }
                _ => {
                    entry.probe_started = Some(now);
                    Ok(())
                }
            },
        }
    }

    pub fn mark_success(&self, key: &str) {
        let mut entries = self.lock();
        entries.remove(key);
    }

    pub fn mark_failure(&self, key: &str) {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(BreakerEntry::closed);

        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);

        if entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.trip(now);
        }
    }

    pub fn state(&self, key: &str) -> BreakerState {
        self.lock()
            .get(key)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn stats(&self, key: &str) -> BreakerStats {
        match self.lock().get(key) {
            Some(entry) => BreakerStats {
                state: entry.state,
                failure_count: entry.consecutive_failures,
                last_failure: entry.last_failure,
            },
            None => BreakerStats {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            },
        }
    }

    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: usize,
    pub last_failure: Option<Instant>,
}
