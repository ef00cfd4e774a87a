//! Volatile in-process store.

use async_trait::async_trait;
use haven_core::HavenError;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::{DurableStore, StoreRegion};

/// In-memory store. Used as the alternate persistence path and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    regions: RwLock<BTreeMap<StoreRegion, BTreeMap<String, JsonValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a region.
    pub fn len(&self, region: StoreRegion) -> usize {
        self.regions.read().get(&region).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError> {
        Ok(self
            .regions
            .read()
            .get(&region)
            .and_then(|r| r.get(key))
            .cloned())
    }

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError> {
        self.regions
            .write()
            .entry(region)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        Ok(self
            .regions
            .write()
            .get_mut(&region)
            .map_or(false, |r| r.remove(key).is_some()))
    }

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        Ok(self
            .regions
            .read()
            .get(&region)
            .map(|r| r.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        Ok(self
            .regions
            .write()
            .remove(&region)
            .map_or(0, |r| r.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_is_key_ordered() {
        let store = MemoryStore::new();
        store.put(StoreRegion::OfflineQueue, "00000000000000000002", json!(2)).await.unwrap();
        store.put(StoreRegion::OfflineQueue, "00000000000000000001", json!(1)).await.unwrap();
        let values: Vec<_> = store
            .list(StoreRegion::OfflineQueue)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_regions_are_isolated() {
        let store = MemoryStore::new();
        store.put(StoreRegion::ServiceHealth, "k", json!(1)).await.unwrap();
        assert!(store.get(StoreRegion::ErrorLog, "k").await.unwrap().is_none());
        assert_eq!(store.clear(StoreRegion::ServiceHealth).await.unwrap(), 1);
        assert!(!store.delete(StoreRegion::ServiceHealth, "k").await.unwrap());
    }
}
