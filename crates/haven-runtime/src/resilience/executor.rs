//! The protected-call path.
//!
//! Every call to an upstream dependency goes through [`Resilience`]:
//! circuit gate, attempt budget, retry with backoff and a per-attempt
//! timeout. Failures are recorded to the error log before they surface.

use haven_core::{FallbackResolver, HavenError, ServiceHealthRecord, Substitute};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::CircuitBreakerRegistry;
use super::limiter::AttemptLimiter;
use super::retry::{retry_with_backoff, RetryPolicy};
use crate::reporting::ErrorReporter;
use crate::store::{StoreGuard, StoreRegion};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the default retry policy
    pub retry: Option<RetryPolicy>,

    /// Replaces the default per-attempt timeout
    pub timeout: Option<Duration>,

    /// Extra context recorded with any failure
    pub context: Vec<(String, String)>,
}

impl CallOptions {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            retry: Some(RetryPolicy::none()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }
}

/// Live content or a deterministic substitute.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<T> {
    Live(T),
    Fallback(Substitute),
}

impl<T> Resolved<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Resolved::Fallback(_))
    }

    pub fn live(self) -> Option<T> {
        match self {
            Resolved::Live(value) => Some(value),
            Resolved::Fallback(_) => None,
        }
    }
}

/// Shared protected-call executor. Cloning shares all state.
#[derive(Clone)]
pub struct Resilience {
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<AttemptLimiter>,
    reporter: Arc<ErrorReporter>,
    fallbacks: Arc<FallbackResolver>,
    retry: RetryPolicy,
    timeout: Duration,
    store: Option<StoreGuard>,
}

impl Resilience {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<AttemptLimiter>,
        reporter: Arc<ErrorReporter>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            breakers,
            limiter,
            reporter,
            fallbacks: Arc::new(FallbackResolver::default()),
            retry,
            timeout,
            store: None,
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: Arc<FallbackResolver>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Persist health snapshots to `serviceHealth` on state changes.
    pub fn with_store(mut self, store: StoreGuard) -> Self {
        self.store = Some(store);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    pub fn fallbacks(&self) -> &Arc<FallbackResolver> {
        &self.fallbacks
    }

    /// Run `action` against `service` through the circuit and retry engine.
    ///
    /// Only `Network` and upstream `ServiceUnavailable` failures are retried
    /// and count against the circuit. A half-open probe gets exactly one
    /// attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        service: &str,
        options: &CallOptions,
        mut action: F,
    ) -> Result<T, HavenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HavenError>>,
    {
        let permit = match self.breakers.admit(service) {
            Ok(permit) => permit,
            Err(err) => {
                self.report(service, options, &err);
                return Err(err);
            }
        };
        if let Err(err) = self.limiter.try_acquire(service) {
            permit.abandon();
            self.report(service, options, &err);
            return Err(err);
        }

        let policy = if permit.is_probe() {
            RetryPolicy::none()
        } else {
            options.retry.clone().unwrap_or_else(|| self.retry.clone())
        };
        let timeout = options.timeout.unwrap_or(self.timeout);

        let result = retry_with_backoff(
            &policy,
            || {
                let attempt = action();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(HavenError::timeout(timeout)),
                    }
                }
            },
            |err, _| err.is_retryable(),
        )
        .await;

        let transition = match &result {
            Ok(_) => permit.succeed(),
            Err(err) if err.trips_breaker() => permit.fail(),
            Err(_) => {
                permit.abandon();
                None
            }
        };
        if transition.is_some() {
            self.persist_health(service).await;
        }
        if let Err(err) = &result {
            self.report(service, options, err);
        }
        result
    }

    /// Like [`execute`](Self::execute), but failures other than invalid
    /// input resolve through `fallback`.
    pub async fn execute_or_else<T, F, Fut, G>(
        &self,
        service: &str,
        options: &CallOptions,
        action: F,
        fallback: G,
    ) -> Result<T, HavenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HavenError>>,
        G: FnOnce(&HavenError) -> T,
    {
        match self.execute(service, options, action).await {
            Ok(value) => Ok(value),
            Err(err) if matches!(err.root(), HavenError::Validation { .. }) => Err(err),
            Err(err) => {
                tracing::info!(service, error = %err, "Serving fallback");
                Ok(fallback(&err))
            }
        }
    }

    /// Fetch content, substituting from the fallback table on failure.
    pub async fn fetch_content<T, F, Fut>(
        &self,
        service: &str,
        content_type: &str,
        context: Option<&str>,
        options: &CallOptions,
        mut action: F,
    ) -> Result<Resolved<T>, HavenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HavenError>>,
    {
        let fallbacks = self.fallbacks.clone();
        self.execute_or_else(
            service,
            options,
            || {
                let fut = action();
                async move { fut.await.map(Resolved::Live) }
            },
            |_| Resolved::Fallback(fallbacks.resolve(content_type, context)),
        )
        .await
    }

    fn report(&self, service: &str, options: &CallOptions, err: &HavenError) {
        let attempts = err.attempts().to_string();
        let mut context: Vec<(&str, &str)> = vec![("service", service), ("attempts", attempts.as_str())];
        context.extend(options.context.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.reporter.record(err, &context);
    }

    async fn persist_health(&self, service: &str) {
        let (Some(store), Some(record)) = (&self.store, self.breakers.snapshot(service)) else {
            return;
        };
        if let Err(err) = store.put(StoreRegion::ServiceHealth, service, &record).await {
            tracing::warn!(service, error = %err, "Could not persist circuit state");
            self.reporter.record(&err, &[("service", service), ("action", "persist-health")]);
        }
    }

    /// Persist every known circuit.
    pub async fn persist_all_health(&self) -> Result<usize, HavenError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let snapshots = self.breakers.snapshots();
        for record in &snapshots {
            store
                .put(StoreRegion::ServiceHealth, &record.service, record)
                .await?;
        }
        Ok(snapshots.len())
    }

    /// Load circuits persisted by an earlier session.
    pub async fn restore_health(&self) -> Result<usize, HavenError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records: Vec<(String, ServiceHealthRecord)> =
            store.list(StoreRegion::ServiceHealth).await?;
        let restored = self
            .breakers
            .restore(records.into_iter().map(|(_, record)| record));
        tracing::info!(restored, "Restored circuit state");
        Ok(restored)
    }
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("breakers", &self.breakers)
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}
