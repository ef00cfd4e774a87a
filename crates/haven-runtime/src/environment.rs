//! Startup capability detection.

use chrono::{DateTime, Utc};
use haven_core::{Clock, HavenError};
use serde::Serialize;
use std::fmt;

use crate::network::NetworkClient;
use crate::store::{StoreGuard, StoreRegion};

const PROBE_KEY: &str = "__haven_probe__";

/// What the durable store can do on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreCapability {
    /// Writes survive a restart
    Persistent,
    /// Writes work but are lost on restart
    Volatile,
    Unavailable,
}

impl fmt::Display for StoreCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreCapability::Persistent => write!(f, "persistent"),
            StoreCapability::Volatile => write!(f, "volatile"),
            StoreCapability::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Capabilities detected once at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Environment {
    pub store: StoreCapability,
    pub store_backend: String,
    pub network_reachable: bool,
    pub network_client: String,
    /// Whether queued writes can be replayed in the background
    pub background_sync: bool,
    pub detected_at: DateTime<Utc>,
}

impl Environment {
    /// Probe the store with a write/read/delete round trip and ask the
    /// network client whether it can reach its backend.
    pub async fn detect(store: &StoreGuard, network: &dyn NetworkClient, clock: &dyn Clock) -> Self {
        let capability = match probe_store(store).await {
            Ok(()) if store.is_persistent() => StoreCapability::Persistent,
            Ok(()) => StoreCapability::Volatile,
            Err(e) => {
                tracing::warn!(backend = store.store().name(), error = %e, "Durable store probe failed");
                StoreCapability::Unavailable
            }
        };
        let network_reachable = network.is_reachable().await;
        let env = Environment {
            store: capability,
            store_backend: store.store().name().to_string(),
            network_reachable,
            network_client: network.name().to_string(),
            background_sync: capability != StoreCapability::Unavailable,
            detected_at: clock.now(),
        };
        tracing::info!(
            store = %env.store,
            backend = %env.store_backend,
            network_reachable,
            background_sync = env.background_sync,
            "Environment detected"
        );
        env
    }

    pub fn is_degraded(&self) -> bool {
        self.store != StoreCapability::Persistent || !self.network_reachable
    }
}

async fn probe_store(store: &StoreGuard) -> Result<(), HavenError> {
    let token = uuid::Uuid::new_v4().to_string();
    store.put(StoreRegion::ErrorLog, PROBE_KEY, &token).await?;
    let read: Option<String> = store.get(StoreRegion::ErrorLog, PROBE_KEY).await?;
    store.delete(StoreRegion::ErrorLog, PROBE_KEY).await?;
    if read.as_deref() != Some(token.as_str()) {
        return Err(HavenError::storage(
            StoreRegion::ErrorLog.name(),
            "probe value did not read back",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, MemoryStore};
    use crate::testing::{FailingStore, ScriptedNetwork};
    use haven_core::SystemClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn guard(store: Arc<dyn crate::store::DurableStore>) -> StoreGuard {
        StoreGuard::new(store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_memory_store_is_volatile() {
        let store = guard(Arc::new(MemoryStore::new()));
        let env = Environment::detect(&store, &ScriptedNetwork::new(), &SystemClock).await;
        assert_eq!(env.store, StoreCapability::Volatile);
        assert!(env.background_sync);
        assert!(env.is_degraded());
        assert!(store.list_raw(StoreRegion::ErrorLog).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_is_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = guard(Arc::new(FileStore::open(dir.path()).unwrap()));
        let env = Environment::detect(&store, &ScriptedNetwork::new(), &SystemClock).await;
        assert_eq!(env.store, StoreCapability::Persistent);
        assert!(env.network_reachable);
        assert!(!env.is_degraded());
    }

    #[tokio::test]
    async fn test_failing_store_and_offline_network() {
        let store = guard(Arc::new(FailingStore::new()));
        let network = ScriptedNetwork::new();
        network.go_offline();
        let env = Environment::detect(&store, &network, &SystemClock).await;
        assert_eq!(env.store, StoreCapability::Unavailable);
        assert!(!env.background_sync);
        assert!(!env.network_reachable);
    }
}
