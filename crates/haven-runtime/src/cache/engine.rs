//! Strategy engine for read traffic.
//!
//! | Class               | Strategy                | Region        |
//! |---------------------|-------------------------|---------------|
//! | critical, static    | stale-while-revalidate  | performance / static |
//! | api, navigation, other | network-first        | dynamic       |
//! | image               | cache-first             | image         |
//!
//! The network leg always goes through the protected-call path, keyed by
//! the request host.

use haven_core::{
    CacheEntry, CacheRequest, CacheStrategy, Classified, Clock, Degraded, HavenError,
    RequestClassifier, Substitute,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::store::CacheStore;
use crate::network::{NetworkClient, NetworkRequest};
use crate::resilience::{CallOptions, Resilience};

/// A response body and its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBody {
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl From<CacheEntry> for CachedBody {
    fn from(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            body: entry.body,
            content_type: entry.content_type,
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheResponse {
    /// Fetched live
    Network(CachedBody),
    /// Served from the cache; `fresh` is false for a stale entry
    Cached { body: CachedBody, fresh: bool },
    /// Substitute content after a failed fetch and a cache miss
    Fallback(Substitute),
    /// Nothing to serve
    Unavailable(Degraded),
}

impl CacheResponse {
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            CacheResponse::Network(b) | CacheResponse::Cached { body: b, .. } => Some(&b.body),
            CacheResponse::Fallback(_) | CacheResponse::Unavailable(_) => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, CacheResponse::Network(_))
    }
}

struct EngineInner {
    classifier: RequestClassifier,
    store: Arc<CacheStore>,
    network: Arc<dyn NetworkClient>,
    resilience: Resilience,
    clock: Arc<dyn Clock>,
    revalidating: Mutex<HashSet<String>>,
}

/// Applies caching strategies to read requests. Cloning shares state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    pub fn new(
        store: Arc<CacheStore>,
        network: Arc<dyn NetworkClient>,
        resilience: Resilience,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let classifier = RequestClassifier::new(store.config().critical_paths.iter().cloned());
        Self {
            inner: Arc::new(EngineInner {
                classifier,
                store,
                network,
                resilience,
                clock,
                revalidating: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn classify(&self, request: &CacheRequest) -> Result<Classified, HavenError> {
        self.inner.classifier.classify(request)
    }

    /// Serve a read request.
    ///
    /// Fails only for a malformed URL. Everything else resolves to one
    /// of the [`CacheResponse`] variants.
    pub async fn handle(&self, request: &CacheRequest) -> Result<CacheResponse, HavenError> {
        let classified = match self.classify(request) {
            Ok(c) => c,
            Err(err) => {
                self.inner.resilience.reporter().record(&err, &[("url", request.url.as_str())]);
                return Err(err);
            }
        };
        tracing::debug!(key = %classified.key, class = ?classified.class, "Handling request");
        let response = match classified.class.strategy() {
            CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(classified).await,
            CacheStrategy::NetworkFirst => self.network_first(classified).await,
            CacheStrategy::CacheFirst => self.cache_first(classified).await,
        };
        Ok(response)
    }

    async fn network_first(&self, classified: Classified) -> CacheResponse {
        let region = classified.class.region();
        let err = match self.fetch(&classified).await {
            Ok(body) => {
                self.remember(&classified, &body).await;
                return CacheResponse::Network(body);
            }
            Err(err) => err,
        };
        match self.inner.store.fresh(region, &classified.key).await {
            Ok(Some(entry)) => {
                tracing::info!(key = %classified.key, error = %err, "Serving cached copy after failed fetch");
                return CacheResponse::Cached {
                    body: entry.into(),
                    fresh: true,
                };
            }
            Ok(None) => {}
            Err(store_err) => self.report_storage(&classified, &store_err),
        }
        CacheResponse::Fallback(self.substitute(&classified))
    }

    async fn stale_while_revalidate(&self, classified: Classified) -> CacheResponse {
        let region = classified.class.region();
        let cached = match self.inner.store.lookup(region, &classified.key).await {
            Ok(entry) => entry,
            Err(err) => {
                self.report_storage(&classified, &err);
                None
            }
        };
        if let Some(entry) = cached {
            let fresh = !entry.is_expired(self.inner.clock.now());
            self.spawn_revalidate(classified);
            return CacheResponse::Cached {
                body: entry.into(),
                fresh,
            };
        }
        match self.fetch(&classified).await {
            Ok(body) => {
                self.remember(&classified, &body).await;
                CacheResponse::Network(body)
            }
            Err(err) => CacheResponse::Unavailable(Degraded::from_error(&classified.path, &err)),
        }
    }

    async fn cache_first(&self, classified: Classified) -> CacheResponse {
        let region = classified.class.region();
        match self.inner.store.lookup(region, &classified.key).await {
            Ok(Some(entry)) => {
                let fresh = !entry.is_expired(self.inner.clock.now());
                return CacheResponse::Cached {
                    body: entry.into(),
                    fresh,
                };
            }
            Ok(None) => {}
            Err(err) => self.report_storage(&classified, &err),
        }
        match self.fetch(&classified).await {
            Ok(body) => {
                let limit = self.inner.store.config().image_size_limit;
                if body.body.len() as u64 <= limit {
                    self.remember(&classified, &body).await;
                } else {
                    tracing::debug!(key = %classified.key, size = body.body.len(), limit, "Image too large to cache");
                }
                CacheResponse::Network(body)
            }
            Err(_) => CacheResponse::Fallback(self.substitute(&classified)),
        }
    }

    /// Refetch `classified` in the background, at most once per key.
    fn spawn_revalidate(&self, classified: Classified) {
        if !self.inner.revalidating.lock().insert(classified.key.clone()) {
            tracing::trace!(key = %classified.key, "Revalidation already running");
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.fetch(&classified).await {
                Ok(body) => engine.remember(&classified, &body).await,
                Err(err) => {
                    tracing::debug!(key = %classified.key, error = %err, "Background revalidation failed")
                }
            }
            engine.inner.revalidating.lock().remove(&classified.key);
        });
    }

    /// Background refreshes still running.
    pub fn pending_revalidations(&self) -> usize {
        self.inner.revalidating.lock().len()
    }

    async fn fetch(&self, classified: &Classified) -> Result<CachedBody, HavenError> {
        let network = &self.inner.network;
        let service = classified.host.as_str();
        let options = CallOptions::default().with_context("url", classified.key.clone());
        let response = self
            .inner
            .resilience
            .execute(service, &options, move || async move {
                network
                    .send(NetworkRequest::get(classified.url.clone()))
                    .await?
                    .into_success(service)
            })
            .await?;
        Ok(CachedBody {
            key: classified.key.clone(),
            body: response.body,
            content_type: response.content_type,
        })
    }

    async fn remember(&self, classified: &Classified, body: &CachedBody) {
        let category = classified.class.category();
        let entry = CacheEntry {
            key: classified.key.clone(),
            body: body.body.clone(),
            content_type: body.content_type.clone(),
            cached_at: self.inner.clock.now(),
            ttl: self.inner.store.config().ttl_for(category),
            region: classified.class.region(),
            category,
            strategy: classified.class.strategy(),
        };
        if let Err(err) = self.inner.store.put(entry).await {
            self.report_storage(classified, &err);
        }
    }

    fn substitute(&self, classified: &Classified) -> Substitute {
        self.inner
            .resilience
            .fallbacks()
            .resolve(classified.class.fallback_content_type(), Some(classified.path.as_str()))
    }

    fn report_storage(&self, classified: &Classified, err: &HavenError) {
        tracing::warn!(key = %classified.key, error = %err, "Cache storage failed");
        self.inner
            .resilience
            .reporter()
            .record(err, &[("url", classified.key.as_str()), ("component", "cache")]);
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("store", &self.inner.store)
            .field("pending_revalidations", &self.pending_revalidations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::ErrorReporter;
    use crate::resilience::{AttemptLimiter, CircuitBreakerRegistry, RetryPolicy};
    use crate::store::{MemoryStore, StoreGuard, StoreRegion};
    use crate::testing::{settle, Scripted, ScriptedNetwork};
    use chrono::Utc;
    use haven_core::{
        CacheConfig, CacheRegion, CircuitBreakerConfig, FallbackSource, LimiterConfig,
        ManualClock, ResourceHint,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: CacheEngine,
        network: Arc<ScriptedNetwork>,
        clock: Arc<ManualClock>,
        guard: StoreGuard,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = StoreGuard::new(Arc::new(MemoryStore::new()), Duration::from_secs(5));
        let network = Arc::new(ScriptedNetwork::new());
        let resilience = Resilience::new(
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), clock.clone())),
            Arc::new(AttemptLimiter::new(&LimiterConfig::default(), clock.clone())),
            Arc::new(ErrorReporter::new(100, clock.clone())),
            RetryPolicy::none(),
            Duration::from_secs(10),
        );
        let store = Arc::new(CacheStore::new(guard.clone(), config, clock.clone()));
        let engine = CacheEngine::new(store, network.clone(), resilience, clock.clone());
        Fixture {
            engine,
            network,
            clock,
            guard,
        }
    }

    fn req(url: &str, hint: ResourceHint) -> CacheRequest {
        CacheRequest::new(url, hint)
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_caches_then_serves_on_failure() {
        let f = fixture(CacheConfig::default());
        f.network.on("/api/steps", vec![Scripted::json(json!({"steps": 9000})), Scripted::offline()]);

        let first = f.engine.handle(&req("/api/steps", ResourceHint::Data)).await.unwrap();
        assert!(first.is_network());

        let second = f.engine.handle(&req("/api/steps", ResourceHint::Data)).await.unwrap();
        match second {
            CacheResponse::Cached { body, fresh } => {
                assert!(fresh);
                assert_eq!(body.body, json!({"steps": 9000}).to_string().into_bytes());
            }
            other => panic!("expected cached response, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_first_never_serves_expired_entry() {
        let f = fixture(CacheConfig::default());
        f.network.on("/api/insights", vec![Scripted::json(json!({"ok": true})), Scripted::offline()]);
        f.engine.handle(&req("/api/insights", ResourceHint::Data)).await.unwrap();

        f.clock.advance(Duration::from_millis(90_000_000));
        let response = f.engine.handle(&req("/api/insights", ResourceHint::Data)).await.unwrap();
        match response {
            CacheResponse::Fallback(sub) => assert_ne!(sub.source, FallbackSource::Generic),
            other => panic!("expected fallback, got {other:?}"),
        }
        assert_eq!(f.network.count_matching("/api/insights"), 2);
        let raw = f
            .guard
            .list_raw(StoreRegion::CacheEntries(CacheRegion::Dynamic))
            .await
            .unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_serves_stale_and_refreshes_once() {
        let f = fixture(CacheConfig::default());
        f.network.on("/app.js", vec![Scripted::bytes("text/javascript", b"v1".to_vec())]);
        f.engine.handle(&req("/app.js", ResourceHint::Script)).await.unwrap();

        f.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
        f.network.on("/app.js", vec![Scripted::bytes("text/javascript", b"v2".to_vec())]);
        f.network.set_delay(Duration::from_millis(50));

        let first = f.engine.handle(&req("/app.js", ResourceHint::Script)).await.unwrap();
        let second = f.engine.handle(&req("/app.js", ResourceHint::Script)).await.unwrap();
        assert_eq!(first.body(), Some(&b"v1"[..]));
        assert!(matches!(first, CacheResponse::Cached { fresh: false, .. }));
        assert_eq!(second.body(), Some(&b"v1"[..]));
        assert_eq!(f.engine.pending_revalidations(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(f.engine.pending_revalidations(), 0);
        // one initial fetch plus exactly one background refresh
        assert_eq!(f.network.count_matching("/app.js"), 2);

        f.network.set_delay(Duration::ZERO);
        let third = f.engine.handle(&req("/app.js", ResourceHint::Script)).await.unwrap();
        assert_eq!(third.body(), Some(&b"v2"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate_miss_offline_is_unavailable() {
        let f = fixture(CacheConfig::default());
        f.network.go_offline();
        let response = f.engine.handle(&req("/", ResourceHint::Navigate)).await.unwrap();
        match response {
            CacheResponse::Unavailable(degraded) => assert!(!degraded.data_at_risk),
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_first_respects_size_limit() {
        let f = fixture(CacheConfig {
            image_size_limit: 4,
            ..CacheConfig::default()
        });
        f.network.on("/small.png", vec![Scripted::bytes("image/png", vec![1, 2, 3])]);
        f.network.on("/large.png", vec![Scripted::bytes("image/png", vec![0; 64])]);

        f.engine.handle(&req("/small.png", ResourceHint::Image)).await.unwrap();
        f.engine.handle(&req("/large.png", ResourceHint::Image)).await.unwrap();
        f.engine.handle(&req("/small.png", ResourceHint::Image)).await.unwrap();
        f.engine.handle(&req("/large.png", ResourceHint::Image)).await.unwrap();

        assert_eq!(f.network.count_matching("/small.png"), 1);
        assert_eq!(f.network.count_matching("/large.png"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_miss_offline_falls_back() {
        let f = fixture(CacheConfig::default());
        f.network.go_offline();
        let response = f.engine.handle(&req("/avatar.png", ResourceHint::Image)).await.unwrap();
        assert!(matches!(response, CacheResponse::Fallback(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_validation_error() {
        let f = fixture(CacheConfig::default());
        let err = f
            .engine
            .handle(&req("http://[::1", ResourceHint::Other))
            .await
            .unwrap_err();
        assert!(matches!(err, HavenError::Validation { .. }));
    }
}
