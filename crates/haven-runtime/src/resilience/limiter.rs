//! Per-action attempt budgets.
//!
//! Caps how many protected calls an action may start within a window.
//! Disabled unless `limiter.max_attempts` is configured.

use chrono::{DateTime, Utc};
use haven_core::clock::elapsed;
use haven_core::{Clock, HavenError, LimiterConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Attempt budget for one action within the current window.
pub struct AttemptBudget {
    /// Maximum attempts per window
    pub max_attempts: u32,

    used: AtomicU32,
    window_start: Mutex<DateTime<Utc>>,
}

impl AttemptBudget {
    pub fn new(max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            max_attempts,
            used: AtomicU32::new(0),
            window_start: Mutex::new(now),
        }
    }

    /// Take one attempt if any remain.
    pub fn try_record(&self) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_attempts).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.used())
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    /// Start a new window at `now`.
    pub fn reset(&self, now: DateTime<Utc>) {
        *self.window_start.lock() = now;
        self.used.store(0, Ordering::SeqCst);
    }

    fn window_age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(now, *self.window_start.lock())
    }
}

/// Budgets keyed by action name.
pub struct AttemptLimiter {
    max_attempts: Option<u32>,
    window: Duration,
    budgets: RwLock<HashMap<String, Arc<AttemptBudget>>>,
    clock: Arc<dyn Clock>,
}

impl AttemptLimiter {
    pub fn new(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: config.max_attempts,
            window: config.window,
            budgets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited(clock: Arc<dyn Clock>) -> Self {
        Self::new(&LimiterConfig::default(), clock)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts.is_some()
    }

    fn budget(&self, action: &str, max: u32) -> Arc<AttemptBudget> {
        if let Some(budget) = self.budgets.read().get(action) {
            return budget.clone();
        }
        self.budgets
            .write()
            .entry(action.to_string())
            .or_insert_with(|| Arc::new(AttemptBudget::new(max, self.clock.now())))
            .clone()
    }

    /// Spend one attempt for `action`, or fail with `RateLimited`.
    pub fn try_acquire(&self, action: &str) -> Result<(), HavenError> {
        let Some(max) = self.max_attempts else {
            return Ok(());
        };
        let now = self.clock.now();
        let budget = self.budget(action, max);
        let age = budget.window_age(now);
        if age >= self.window {
            budget.reset(now);
        }
        if budget.try_record() {
            Ok(())
        } else {
            let resets_in = self.window.saturating_sub(budget.window_age(now));
            tracing::warn!(action, ?resets_in, "Attempt budget exhausted");
            Err(HavenError::RateLimited {
                action: action.to_string(),
                resets_in,
            })
        }
    }

    /// Attempts left in the current window; `None` when unlimited.
    pub fn remaining(&self, action: &str) -> Option<u32> {
        let max = self.max_attempts?;
        let budget = self.budgets.read().get(action).cloned();
        Some(match budget {
            Some(b) if b.window_age(self.clock.now()) < self.window => b.remaining(),
            _ => max,
        })
    }

    pub fn reset(&self) {
        self.budgets.write().clear();
    }
}

impl std::fmt::Debug for AttemptLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptLimiter")
            .field("max_attempts", &self.max_attempts)
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::ManualClock;

    fn limiter(max: u32) -> (AttemptLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = LimiterConfig {
            max_attempts: Some(max),
            window: Duration::from_secs(60),
        };
        (AttemptLimiter::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_budget_tracks_usage() {
        let budget = AttemptBudget::new(2, Utc::now());
        assert!(budget.try_record());
        assert!(budget.try_record());
        assert!(!budget.try_record());
        assert_eq!(budget.used(), 2);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_exhausts_then_resets_after_window() {
        let (limiter, clock) = limiter(2);
        limiter.try_acquire("insight-service").unwrap();
        limiter.try_acquire("insight-service").unwrap();
        let err = limiter.try_acquire("insight-service").unwrap_err();
        assert!(matches!(err, HavenError::RateLimited { .. }));
        assert_eq!(limiter.remaining("insight-service"), Some(0));

        clock.advance(Duration::from_secs(60));
        assert!(limiter.try_acquire("insight-service").is_ok());
    }

    #[test]
    fn test_actions_are_independent() {
        let (limiter, _) = limiter(1);
        limiter.try_acquire("a").unwrap();
        assert!(limiter.try_acquire("b").is_ok());
    }

    #[test]
    fn test_unlimited_by_default() {
        let limiter = AttemptLimiter::unlimited(Arc::new(haven_core::SystemClock));
        assert!(!limiter.is_enabled());
        for _ in 0..1_000 {
            limiter.try_acquire("sync").unwrap();
        }
        assert_eq!(limiter.remaining("sync"), None);
    }
}
