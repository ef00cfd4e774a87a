//! Primary store with a single alternate persistence path.

use async_trait::async_trait;
use haven_core::HavenError;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{DurableStore, StoreRegion};
use crate::events::{EventBus, HavenEvent};

/// Headroom on top of two backend timeouts for the outer guard.
const GUARD_SLACK: Duration = Duration::from_millis(500);

/// Writes the alternate took while the primary was failing.
#[derive(Debug, Default)]
struct Divergence {
    keys: BTreeSet<(StoreRegion, String)>,
    cleared: BTreeSet<StoreRegion>,
}

impl Divergence {
    fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.cleared.is_empty()
    }
}

/// Which mutation an operation makes, for reconciliation.
#[derive(Clone, Copy)]
enum Touch<'k> {
    Read,
    Key(&'k str),
    Clear,
}

/// Tries `primary`, then `alternate` once per operation.
///
/// A failure on both paths is reported as a fatal storage error and a
/// `data-at-risk` event. Writes the alternate takes are remembered and
/// copied back to the primary before it serves anything again, so a
/// volatile alternate only has to hold them until the primary recovers.
pub struct FailoverStore {
    primary: Arc<dyn DurableStore>,
    alternate: Arc<dyn DurableStore>,
    events: Option<EventBus>,
    backend_timeout: Option<Duration>,
    divergence: Mutex<Divergence>,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn DurableStore>, alternate: Arc<dyn DurableStore>) -> Self {
        Self {
            primary,
            alternate,
            events: None,
            backend_timeout: None,
            divergence: Mutex::new(Divergence::default()),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound each backend call, so a hung primary still leaves time for
    /// the alternate.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    /// Longest a single operation can take, primary and alternate
    /// included. An outer timeout must not be shorter than this.
    pub fn worst_case(&self) -> Option<Duration> {
        self.backend_timeout.map(|t| t * 2 + GUARD_SLACK)
    }

    /// Whether the alternate holds writes the primary has not seen.
    pub async fn is_diverged(&self) -> bool {
        !self.divergence.lock().await.is_empty()
    }

    fn emit(&self, event: HavenEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    async fn bounded<T>(
        &self,
        store: &dyn DurableStore,
        region: StoreRegion,
        fut: impl Future<Output = Result<T, HavenError>>,
    ) -> Result<T, HavenError> {
        let Some(limit) = self.backend_timeout else {
            return fut.await;
        };
        tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(HavenError::storage(
                region.name(),
                format!("{} did not respond within {limit:?}", store.name()),
            ))
        })
    }

    /// Copy every diverged key back to the primary, dropping it from the
    /// alternate once the primary has it.
    async fn reconcile(&self, divergence: &mut Divergence) -> Result<(), HavenError> {
        let primary = self.primary.as_ref();
        let alternate = self.alternate.as_ref();

        while let Some(region) = divergence.cleared.first().copied() {
            self.bounded(primary, region, primary.clear(region)).await?;
            divergence.cleared.remove(&region);
        }
        while let Some((region, key)) = divergence.keys.first().cloned() {
            let value = self.bounded(alternate, region, alternate.get(region, &key)).await?;
            match value {
                Some(value) => {
                    self.bounded(primary, region, primary.put(region, &key, value)).await?;
                    self.bounded(alternate, region, alternate.delete(region, &key)).await?;
                }
                None => {
                    self.bounded(primary, region, primary.delete(region, &key)).await?;
                }
            }
            divergence.keys.remove(&(region, key));
        }
        tracing::info!(store = self.primary.name(), "Primary store recovered, alternate writes copied back");
        Ok(())
    }

    /// Bring the primary up to date before it serves another operation.
    async fn catch_up(&self) -> Result<(), HavenError> {
        let mut divergence = self.divergence.lock().await;
        if divergence.is_empty() {
            return Ok(());
        }
        self.reconcile(&mut divergence).await
    }

    async fn attempt<'a, T, F, Fut>(
        &'a self,
        region: StoreRegion,
        touch: Touch<'_>,
        op: F,
    ) -> Result<T, HavenError>
    where
        F: Fn(&'a dyn DurableStore) -> Fut,
        Fut: Future<Output = Result<T, HavenError>>,
    {
        let primary = self.primary.as_ref();
        let primary_result = match self.catch_up().await {
            Ok(()) => self.bounded(primary, region, op(primary)).await,
            Err(e) => Err(e),
        };
        let primary_err = match primary_result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        tracing::warn!(
            region = %region,
            store = self.primary.name(),
            error = %primary_err,
            volatile = !self.alternate.is_persistent(),
            "Primary store failed, using alternate"
        );
        self.emit(HavenEvent::StorageDegraded {
            region: region.name().to_string(),
            reason: primary_err.to_string(),
        });

        match self.bounded(self.alternate.as_ref(), region, op(self.alternate.as_ref())).await {
            Ok(value) => {
                let mut divergence = self.divergence.lock().await;
                match touch {
                    Touch::Read => {}
                    Touch::Key(key) => {
                        divergence.keys.insert((region, key.to_string()));
                    }
                    Touch::Clear => {
                        divergence.keys.retain(|(r, _)| *r != region);
                        divergence.cleared.insert(region);
                    }
                }
                Ok(value)
            }
            Err(alternate_err) => {
                tracing::error!(
                    region = %region,
                    store = self.alternate.name(),
                    error = %alternate_err,
                    "Alternate store failed too, data may be lost"
                );
                self.emit(HavenEvent::DataAtRisk {
                    region: region.name().to_string(),
                    reason: alternate_err.to_string(),
                });
                Err(HavenError::storage(
                    region.name(),
                    format!("primary: {primary_err}; alternate: {alternate_err}"),
                )
                .into_fatal())
            }
        }
    }
}

#[async_trait]
impl DurableStore for FailoverStore {
    fn name(&self) -> &str {
        "failover"
    }

    fn is_persistent(&self) -> bool {
        self.primary.is_persistent()
    }

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError> {
        self.attempt(region, Touch::Read, |s| s.get(region, key)).await
    }

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError> {
        self.attempt(region, Touch::Key(key), |s| s.put(region, key, value.clone())).await
    }

    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        self.attempt(region, Touch::Key(key), |s| s.delete(region, key)).await
    }

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        self.attempt(region, Touch::Read, |s| s.list(region)).await
    }

    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        self.attempt(region, Touch::Clear, |s| s.clear(region)).await
    }
}
