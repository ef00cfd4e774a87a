//! Durable store abstraction.
//!
//! The engine never touches host storage directly. Everything persisted
//! goes through [`DurableStore`], a small region/key/JSON interface, so
//! the same engine runs on a file directory, in memory, or on fakes.

mod failover;
mod file;
mod memory;

pub use failover::FailoverStore;
pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use haven_core::{CacheRegion, HavenError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Persisted state layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreRegion {
    /// Keyed by dependency name
    ServiceHealth,
    /// Keyed by normalized request identity, namespaced by cache region
    CacheEntries(CacheRegion),
    /// Keyed by zero-padded sequence, so key order is FIFO order
    OfflineQueue,
    /// Single ring-buffer document
    ErrorLog,
}

impl StoreRegion {
    pub fn name(&self) -> &'static str {
        match self {
            StoreRegion::ServiceHealth => "serviceHealth",
            StoreRegion::CacheEntries(CacheRegion::Static) => "cacheEntries:static",
            StoreRegion::CacheEntries(CacheRegion::Dynamic) => "cacheEntries:dynamic",
            StoreRegion::CacheEntries(CacheRegion::Image) => "cacheEntries:image",
            StoreRegion::CacheEntries(CacheRegion::Performance) => "cacheEntries:performance",
            StoreRegion::OfflineQueue => "offlineQueue",
            StoreRegion::ErrorLog => "errorLog",
        }
    }

    /// Every region, in a stable order.
    pub fn all() -> Vec<StoreRegion> {
        let mut regions = vec![StoreRegion::ServiceHealth];
        regions.extend(CacheRegion::ALL.into_iter().map(StoreRegion::CacheEntries));
        regions.push(StoreRegion::OfflineQueue);
        regions.push(StoreRegion::ErrorLog);
        regions
    }
}

impl fmt::Display for StoreRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Client-local persistent key/value storage, partitioned by region.
///
/// Implementations must serialize writes to the same region.
/// `list` returns entries sorted by key.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store name for logs.
    fn name(&self) -> &str;

    /// Whether data survives a process restart.
    fn is_persistent(&self) -> bool;

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError>;

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError>;

    /// Returns whether the key existed.
    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError>;

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError>;

    /// Remove every key in a region, returning how many were removed.
    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError>;
}

/// Typed, timeout-bounded access to a [`DurableStore`].
#[derive(Clone)]
pub struct StoreGuard {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl fmt::Debug for StoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreGuard")
            .field("store", &self.store.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StoreGuard {
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    async fn bounded<T>(
        &self,
        region: StoreRegion,
        fut: impl Future<Output = Result<T, HavenError>>,
    ) -> Result<T, HavenError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(HavenError::storage(
                region.name(),
                format!("{} did not respond within {:?}", self.store.name(), self.timeout),
            )),
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        region: StoreRegion,
        key: &str,
    ) -> Result<Option<T>, HavenError> {
        let raw = self.bounded(region, self.store.get(region, key)).await?;
        raw.map(|value| decode(region, key, value)).transpose()
    }

    pub async fn put<T: Serialize>(
        &self,
        region: StoreRegion,
        key: &str,
        value: &T,
    ) -> Result<(), HavenError> {
        let value = serde_json::to_value(value).map_err(|e| {
            HavenError::storage(region.name(), format!("cannot encode '{key}': {e}"))
        })?;
        self.bounded(region, self.store.put(region, key, value)).await
    }

    pub async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        self.bounded(region, self.store.delete(region, key)).await
    }

    /// Raw listing; undecodable values are left to the caller.
    pub async fn list_raw(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        self.bounded(region, self.store.list(region)).await
    }

    /// Decoded listing; fails on the first undecodable value.
    pub async fn list<T: DeserializeOwned>(
        &self,
        region: StoreRegion,
    ) -> Result<Vec<(String, T)>, HavenError> {
        self.list_raw(region)
            .await?
            .into_iter()
            .map(|(key, value)| decode(region, &key, value).map(|v| (key, v)))
            .collect()
    }

    pub async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        self.bounded(region, self.store.clear(region)).await
    }
}

fn decode<T: DeserializeOwned>(
    region: StoreRegion,
    key: &str,
    value: JsonValue,
) -> Result<T, HavenError> {
    serde_json::from_value(value)
        .map_err(|e| HavenError::storage(region.name(), format!("corrupt value at '{key}': {e}")))
}
