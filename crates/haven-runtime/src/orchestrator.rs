//! Runtime assembly.
//!
//! [`Haven`] owns one instance of every component and wires them to a
//! shared store, clock and event bus:
//! - a durable store (file directory with in-memory failover, or memory only)
//! - circuit breakers, attempt limiter and error reporter behind [`Resilience`]
//! - the cache strategy engine for reads
//! - the offline queue and its background scheduler for writes

use haven_core::{
    CacheRequest, Clock, ConfigError, FallbackResolver, HavenConfig, HavenError, OperationDraft,
    SystemClock,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::cache::{CacheEngine, CacheResponse, CacheStore};
use crate::connectivity::ConnectivityMonitor;
use crate::environment::Environment;
use crate::events::{EventBus, HavenEvent};
use crate::network::NetworkClient;
use crate::queue::{DrainReport, OfflineQueue, SchedulerHandle, SyncScheduler, WriteOutcome};
use crate::reporting::ErrorReporter;
use crate::resilience::{AttemptLimiter, CircuitBreakerRegistry, Resilience, RetryPolicy};
use crate::store::{DurableStore, FailoverStore, FileStore, MemoryStore, StoreGuard};

/// Errors from assembling the runtime.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot open data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: HavenError,
    },

    #[error("Could not restore persisted state: {0}")]
    Restore(#[from] HavenError),
}

/// Configures and assembles a [`Haven`] runtime.
pub struct HavenBuilder {
    config: HavenConfig,
    network: Arc<dyn NetworkClient>,
    data_dir: Option<PathBuf>,
    store: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    fallbacks: FallbackResolver,
    endpoint: Option<String>,
    online: Option<bool>,
}

impl HavenBuilder {
    pub fn new(network: Arc<dyn NetworkClient>) -> Self {
        Self {
            config: HavenConfig::default(),
            network,
            data_dir: None,
            store: None,
            clock: Arc::new(SystemClock),
            fallbacks: FallbackResolver::default(),
            endpoint: None,
            online: None,
        }
    }

    pub fn config(mut self, config: HavenConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist state under `dir`, failing over to memory if it breaks.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Use a specific store. Takes precedence over [`data_dir`](Self::data_dir).
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fallbacks(mut self, fallbacks: FallbackResolver) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Base URL queued writes replay against.
    pub fn sync_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Initial connectivity. Defaults to what detection finds.
    pub fn online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    pub async fn build(self) -> Result<Haven, StartupError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;
        let events = EventBus::default();

        let storage_timeout = config.timeouts.storage;
        let (backend, guard_timeout): (Arc<dyn DurableStore>, Duration) =
            match (self.store, self.data_dir) {
                (Some(store), _) => (store, storage_timeout),
                (None, Some(dir)) => {
                    let file = FileStore::open(&dir).map_err(|source| StartupError::DataDir {
                        path: dir.clone(),
                        source,
                    })?;
                    let failover = FailoverStore::new(Arc::new(file), Arc::new(MemoryStore::new()))
                        .with_backend_timeout(storage_timeout)
                        .with_events(events.clone());
                    let limit = failover.worst_case().unwrap_or(storage_timeout);
                    (Arc::new(failover), limit)
                }
                (None, None) => (Arc::new(MemoryStore::new()), storage_timeout),
            };
        let store = StoreGuard::new(backend, guard_timeout);

        let environment = Environment::detect(&store, self.network.as_ref(), clock.as_ref()).await;

        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker.clone(), clock.clone())
                .with_events(events.clone()),
        );
        let limiter = Arc::new(AttemptLimiter::new(&config.limiter, clock.clone()));
        let reporter = Arc::new(
            ErrorReporter::new(config.error_log.max_size, clock.clone()).with_store(store.clone()),
        );
        let resilience = Resilience::new(
            breakers,
            limiter,
            reporter.clone(),
            RetryPolicy::from(&config.retry),
            config.timeouts.network,
        )
        .with_fallbacks(Arc::new(self.fallbacks))
        .with_store(store.clone());

        resilience.restore_health().await?;
        reporter.restore().await?;

        let cache_store = Arc::new(CacheStore::new(store.clone(), config.cache.clone(), clock.clone()));
        let cache = CacheEngine::new(
            cache_store.clone(),
            self.network.clone(),
            resilience.clone(),
            clock.clone(),
        );

        let connectivity =
            ConnectivityMonitor::new(self.online.unwrap_or(environment.network_reachable));
        let mut queue = OfflineQueue::builder(store, self.network, resilience.clone())
            .config(config.queue.clone())
            .events(events.clone())
            .connectivity(connectivity.clone())
            .clock(clock);
        if let Some(endpoint) = self.endpoint {
            queue = queue.endpoint(endpoint);
        }
        let queue = queue.open().await?;

        tracing::info!(
            store = %environment.store,
            online = connectivity.is_online(),
            pending = queue.pending_count().await,
            "Haven runtime ready"
        );

        Ok(Haven {
            config,
            environment,
            events,
            connectivity,
            resilience,
            cache_store,
            cache,
            queue,
            scheduler: Mutex::new(None),
        })
    }
}

/// The assembled resilience and offline-continuity runtime.
pub struct Haven {
    config: HavenConfig,
    environment: Environment,
    events: EventBus,
    connectivity: ConnectivityMonitor,
    resilience: Resilience,
    cache_store: Arc<CacheStore>,
    cache: CacheEngine,
    queue: OfflineQueue,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl Haven {
    pub fn builder(network: Arc<dyn NetworkClient>) -> HavenBuilder {
        HavenBuilder::new(network)
    }

    pub fn config(&self) -> &HavenConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HavenEvent> {
        self.events.subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Report a connectivity change from the host.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Serve a read through the cache strategy engine.
    pub async fn fetch(&self, request: &CacheRequest) -> Result<CacheResponse, HavenError> {
        self.cache.handle(request).await
    }

    /// Apply a write now or queue it for replay.
    pub async fn submit(&self, draft: OperationDraft) -> Result<WriteOutcome, HavenError> {
        self.queue.submit(draft).await
    }

    /// Drain the queue now.
    pub async fn sync_now(&self) -> Result<DrainReport, HavenError> {
        self.queue.drain().await
    }

    /// Start background drains and cache sweeps. Idempotent.
    pub fn start_background_sync(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return;
        }
        if !self.environment.background_sync {
            tracing::warn!("No usable store, background sync stays off");
            return;
        }
        *scheduler = Some(
            SyncScheduler::new(self.queue.clone())
                .with_cache(self.cache_store.clone())
                .with_reporter(
                    self.resilience.reporter().clone(),
                    self.config.error_log.flush_interval,
                )
                .spawn(),
        );
    }

    /// Ask a running scheduler for a drain.
    pub fn trigger_sync(&self) {
        if let Some(handle) = self.scheduler.lock().as_ref() {
            handle.trigger();
        }
    }

    /// Stop background work and persist circuit state and the error log.
    pub async fn shutdown(&self) -> Result<(), HavenError> {
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        let circuits = self.resilience.persist_all_health().await?;
        self.resilience.reporter().flush().await?;
        tracing::info!(circuits, "Haven runtime stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Haven {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Haven")
            .field("environment", &self.environment)
            .field("online", &self.connectivity.is_online())
            .field("queue", &self.queue)
            .finish()
    }
}
