//! # haven-runtime
//!
//! Async resilience and offline-continuity runtime for Haven.
//!
//! `haven-core` holds the deterministic pieces (data model, circuit state
//! machine, classification, fallback resolution, configuration). This
//! crate adds everything that waits on I/O:
//! - durable stores behind the [`DurableStore`] trait
//! - the protected-call path ([`Resilience`]): circuit gate, attempt
//!   budget, retry with backoff, timeouts
//! - the cache strategy engine for reads
//! - the offline queue and its sync scheduler for writes
//! - the event bus and connectivity signal
//!
//! ## Example
//!
//! ```rust,ignore
//! use haven_runtime::{Haven, HttpNetworkClient};
//! use haven_core::{CacheRequest, ResourceHint};
//!
//! let network = Arc::new(HttpNetworkClient::from_env(Duration::from_secs(10))?);
//! let haven = Haven::builder(network).data_dir("/var/lib/haven").build().await?;
//! haven.start_background_sync();
//!
//! let response = haven
//!     .fetch(&CacheRequest::new("https://api.example/api/insights", ResourceHint::Data))
//!     .await?;
//! ```

pub mod cache;
pub mod connectivity;
pub mod environment;
pub mod events;
pub mod network;
pub mod orchestrator;
pub mod queue;
pub mod reporting;
pub mod resilience;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CacheEngine, CacheResponse, CacheStore, CachedBody, SweepReport};
pub use connectivity::ConnectivityMonitor;
pub use environment::{Environment, StoreCapability};
pub use events::{EventBus, HavenEvent};
#[cfg(feature = "http")]
pub use network::HttpNetworkClient;
pub use network::{Method, NetworkClient, NetworkRequest, NetworkResponse};
pub use orchestrator::{Haven, HavenBuilder, StartupError};
pub use queue::{
    DrainReport, DrainSkip, OfflineQueue, OfflineQueueBuilder, QueueFilter, QueueLedger,
    SchedulerHandle, SyncScheduler, WriteOutcome, SYNC_SERVICE,
};
pub use reporting::ErrorReporter;
pub use resilience::{
    always, retry_with_backoff, AttemptLimiter, CallOptions, CallPermit, CircuitBreakerRegistry,
    Resilience, Resolved, RetryPolicy,
};
pub use store::{DurableStore, FailoverStore, FileStore, MemoryStore, StoreGuard, StoreRegion};
