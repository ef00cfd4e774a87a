//! Retry with exponential backoff.
//!
//! The delay before retry `n` (1-based) is `base_delay * backoff_factor^(n-1)`,
//! capped at `max_delay`. With jitter on, each delay `d` becomes a random
//! value in `[d, 2d)`.

use backon::{ExponentialBuilder, Retryable};
use haven_core::{HavenError, RetryConfig};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f32,
    pub jitter: bool,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Nominal delay before retry `retry` (1-based), before jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * f64::from(self.backoff_factor).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.backoff_factor)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            max_delay: config.max_delay,
        }
    }
}

/// Retry every error.
pub fn always(_: &HavenError, _: u32) -> bool {
    true
}

/// Run `action` until it succeeds, `condition` declines a retry, or
/// `policy.max_retries` retries are spent.
///
/// `condition` receives the error and the number of attempts made so far.
/// Errors after more than one attempt are wrapped in
/// [`HavenError::RetryExhausted`] carrying the attempt count.
pub async fn retry_with_backoff<T, F, Fut, C>(
    policy: &RetryPolicy,
    mut action: F,
    condition: C,
) -> Result<T, HavenError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HavenError>>,
    C: Fn(&HavenError, u32) -> bool,
{
    let attempts = AtomicU32::new(0);
    let result = (|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        action()
    })
    .retry(policy.backoff())
    .sleep(tokio::time::sleep)
    .when(|e: &HavenError| condition(e, attempts.load(Ordering::SeqCst)))
    .notify(|e: &HavenError, delay: Duration| {
        tracing::debug!(
            attempt = attempts.load(Ordering::SeqCst),
            ?delay,
            error = %e,
            "Retrying after failure"
        );
    })
    .await;

    let attempts = attempts.load(Ordering::SeqCst);
    result.map_err(|e| {
        if attempts > 1 {
            tracing::warn!(attempts, error = %e, "Giving up after retries");
            HavenError::RetryExhausted {
                attempts,
                source: Box::new(e),
            }
        } else {
            e
        }
    })
}
