//! Resilience patterns for haven-runtime.
//!
//! This module provides:
//! - Per-dependency circuit breakers
//! - Retry with exponential backoff
//! - Per-action attempt budgets
//! - The protected-call executor tying them together

mod circuit_breaker;
mod executor;
mod limiter;
mod retry;

pub use circuit_breaker::{CallPermit, CircuitBreakerRegistry};
pub use executor::{CallOptions, Resilience, Resolved};
pub use limiter::{AttemptBudget, AttemptLimiter};
pub use retry::{always, retry_with_backoff, RetryPolicy};
