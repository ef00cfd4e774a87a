//! Cache entries: a moka hot layer over the durable cache regions.
//!
//! Freshness is always judged against the injected clock and the entry's
//! own TTL; moka only bounds how many entries stay in memory.

use haven_core::{CacheConfig, CacheEntry, CacheRegion, Clock, HavenError};
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;

use crate::store::{StoreGuard, StoreRegion};

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Undecodable values removed
    pub corrupt: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.corrupt
    }
}

/// Cache entry storage shared by the strategy engine and the CLI.
pub struct CacheStore {
    hot: Cache<String, CacheEntry>,
    store: StoreGuard,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

fn hot_key(region: CacheRegion, key: &str) -> String {
    format!("{}|{}", region.as_str(), key)
}

impl CacheStore {
    pub fn new(store: StoreGuard, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let hot = Cache::builder()
            .max_capacity(config.memory_capacity.max(1))
            .build();
        Self {
            hot,
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Any entry for `key`, fresh or not.
    pub async fn lookup(
        &self,
        region: CacheRegion,
        key: &str,
    ) -> Result<Option<CacheEntry>, HavenError> {
        let hk = hot_key(region, key);
        if let Some(entry) = self.hot.get(&hk).await {
            return Ok(Some(entry));
        }
        let entry: Option<CacheEntry> = self.store.get(StoreRegion::CacheEntries(region), key).await?;
        if let Some(entry) = &entry {
            self.hot.insert(hk, entry.clone()).await;
        }
        Ok(entry)
    }

    /// A fresh entry for `key`. An expired entry is purged and reported
    /// as a miss.
    pub async fn fresh(
        &self,
        region: CacheRegion,
        key: &str,
    ) -> Result<Option<CacheEntry>, HavenError> {
        match self.lookup(region, key).await? {
            Some(entry) if entry.is_expired(self.clock.now()) => {
                tracing::debug!(key, region = region.as_str(), "Purging expired entry");
                self.purge(region, key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub async fn put(&self, entry: CacheEntry) -> Result<(), HavenError> {
        self.store
            .put(StoreRegion::CacheEntries(entry.region), &entry.key, &entry)
            .await?;
        self.hot.insert(hot_key(entry.region, &entry.key), entry).await;
        Ok(())
    }

    pub async fn purge(&self, region: CacheRegion, key: &str) -> Result<bool, HavenError> {
        self.hot.invalidate(&hot_key(region, key)).await;
        self.store.delete(StoreRegion::CacheEntries(region), key).await
    }

    /// Every decodable entry in a region, in key order.
    pub async fn entries(&self, region: CacheRegion) -> Result<Vec<CacheEntry>, HavenError> {
        let raw = self.store.list_raw(StoreRegion::CacheEntries(region)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect())
    }

    /// Remove entries older than their category TTL, plus anything
    /// undecodable, across every region.
    pub async fn sweep(&self) -> Result<SweepReport, HavenError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        for region in CacheRegion::ALL {
            let store_region = StoreRegion::CacheEntries(region);
            for (key, value) in self.store.list_raw(store_region).await? {
                report.examined += 1;
                let stale = match serde_json::from_value::<CacheEntry>(value) {
                    Ok(entry) => {
                        let expired = entry.age(now) > self.config.ttl_for(entry.category);
                        report.expired += usize::from(expired);
                        expired
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, region = region.as_str(), error = %e, "Removing corrupt cache entry");
                        report.corrupt += 1;
                        true
                    }
                };
                if stale {
                    self.purge(region, &key).await?;
                }
            }
        }
        tracing::info!(
            examined = report.examined,
            expired = report.expired,
            corrupt = report.corrupt,
            "Cache sweep finished"
        );
        Ok(report)
    }

    /// Drop a region, or every region.
    pub async fn clear(&self, region: Option<CacheRegion>) -> Result<usize, HavenError> {
        let regions = match region {
            Some(region) => vec![region],
            None => CacheRegion::ALL.to_vec(),
        };
        let mut removed = 0;
        for region in regions {
            removed += self.store.clear(StoreRegion::CacheEntries(region)).await?;
        }
        self.hot.invalidate_all();
        Ok(removed)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("hot_entries", &self.hot.entry_count())
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use haven_core::{CacheCategory, CacheStrategy, ManualClock};
    use std::time::Duration;

    fn setup() -> (CacheStore, StoreGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = StoreGuard::new(Arc::new(MemoryStore::new()), Duration::from_secs(5));
        let store = CacheStore::new(guard.clone(), CacheConfig::default(), clock.clone());
        (store, guard, clock)
    }

    fn entry(key: &str, category: CacheCategory, region: CacheRegion, clock: &ManualClock) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            body: b"{}".to_vec(),
            content_type: Some("application/json".to_string()),
            cached_at: clock.now(),
            ttl: CacheConfig::default().ttl_for(category),
            region,
            category,
            strategy: CacheStrategy::NetworkFirst,
        }
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged_on_read() {
        let (store, guard, clock) = setup();
        store
            .put(entry("k", CacheCategory::ApiJson, CacheRegion::Dynamic, &clock))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(90_000_000));
        assert!(store.fresh(CacheRegion::Dynamic, "k").await.unwrap().is_none());
        let raw: Option<CacheEntry> = guard
            .get(StoreRegion::CacheEntries(CacheRegion::Dynamic), "k")
            .await
            .unwrap();
        assert!(raw.is_none());
    }

    #[tokio::test]
    async fn test_sweep_uses_category_ttl() {
        let (store, _, clock) = setup();
        store
            .put(entry("api", CacheCategory::ApiJson, CacheRegion::Dynamic, &clock))
            .await
            .unwrap();
        store
            .put(entry("img", CacheCategory::Image, CacheRegion::Image, &clock))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2 * 24 * 60 * 60));

        let report = store.sweep().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.expired, 1);
        assert!(store.lookup(CacheRegion::Dynamic, "api").await.unwrap().is_none());
        assert!(store.lookup(CacheRegion::Image, "img").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_corrupt_values() {
        let (store, guard, _) = setup();
        guard
            .put(StoreRegion::CacheEntries(CacheRegion::Static), "bad", &"not an entry")
            .await
            .unwrap();
        let report = store.sweep().await.unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(guard
            .list_raw(StoreRegion::CacheEntries(CacheRegion::Static))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lookup_reads_through_to_durable_store() {
        let (store, guard, clock) = setup();
        let e = entry("k", CacheCategory::Static, CacheRegion::Static, &clock);
        guard
            .put(StoreRegion::CacheEntries(CacheRegion::Static), "k", &e)
            .await
            .unwrap();
        assert_eq!(store.lookup(CacheRegion::Static, "k").await.unwrap(), Some(e));
    }
}
