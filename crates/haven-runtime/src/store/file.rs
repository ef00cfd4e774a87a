//! File-backed durable store.
//!
//! Each region is one JSON document under the store directory. Writes
//! rewrite the document through a temp file and rename, holding both a
//! per-region async mutex (single writer in this process) and an
//! exclusive `fs2` lock on a sidecar lock file (single writer across
//! processes, e.g. the CLI inspecting a live store).

use async_trait::async_trait;
use fs2::FileExt;
use haven_core::HavenError;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DurableStore, StoreRegion};

type RegionDoc = BTreeMap<String, JsonValue>;

/// Store that persists each region as `<dir>/<region>.json`.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    locks: Mutex<HashMap<StoreRegion, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, HavenError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            HavenError::storage("store", format!("cannot create {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn region_lock(&self, region: StoreRegion) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(region).or_default().clone()
    }

    fn paths(&self, region: StoreRegion) -> RegionPaths {
        let stem = region.name().replace(':', "-");
        RegionPaths {
            region,
            doc: self.root.join(format!("{stem}.json")),
            lock: self.root.join(format!("{stem}.lock")),
        }
    }

    /// Run a read-modify-write on a region document.
    async fn modify<T, F>(&self, region: StoreRegion, f: F) -> Result<T, HavenError>
    where
        T: Send + 'static,
        F: FnOnce(&mut RegionDoc) -> T + Send + 'static,
    {
        let lock = self.region_lock(region);
        let _guard = lock.lock().await;
        let paths = self.paths(region);
        run_blocking(region, move || {
            let lock_file = paths.lock_file()?;
            lock_file.lock_exclusive().map_err(|e| paths.err("lock", e))?;
            let mut doc = paths.read()?;
            let out = f(&mut doc);
            paths.write(&doc)?;
            lock_file.unlock().map_err(|e| paths.err("unlock", e))?;
            Ok(out)
        })
        .await
    }

    async fn read(&self, region: StoreRegion) -> Result<RegionDoc, HavenError> {
        let lock = self.region_lock(region);
        let _guard = lock.lock().await;
        let paths = self.paths(region);
        run_blocking(region, move || {
            let lock_file = paths.lock_file()?;
            lock_file.lock_shared().map_err(|e| paths.err("lock", e))?;
            let doc = paths.read();
            lock_file.unlock().map_err(|e| paths.err("unlock", e))?;
            doc
        })
        .await
    }
}

struct RegionPaths {
    region: StoreRegion,
    doc: PathBuf,
    lock: PathBuf,
}

impl RegionPaths {
    fn err(&self, action: &str, e: impl std::fmt::Display) -> HavenError {
        HavenError::storage(
            self.region.name(),
            format!("{action} {}: {e}", self.doc.display()),
        )
    }

    fn lock_file(&self) -> Result<File, HavenError> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock)
            .map_err(|e| self.err("open lock for", e))
    }

    fn read(&self) -> Result<RegionDoc, HavenError> {
        if !self.doc.exists() {
            return Ok(RegionDoc::new());
        }
        let file = File::open(&self.doc).map_err(|e| self.err("open", e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| self.err("parse", e))
    }

    fn write(&self, doc: &RegionDoc) -> Result<(), HavenError> {
        let tmp = self.doc.with_extension("json.tmp");
        {
            let file = File::create(&tmp).map_err(|e| self.err("create", e))?;
            let mut writer = BufWriter::new(&file);
            serde_json::to_writer(&mut writer, doc).map_err(|e| self.err("encode", e))?;
            writer.flush().map_err(|e| self.err("flush", e))?;
            drop(writer);
            file.sync_all().map_err(|e| self.err("sync", e))?;
        }
        fs::rename(&tmp, &self.doc).map_err(|e| self.err("replace", e))
    }
}

async fn run_blocking<T, F>(region: StoreRegion, f: F) -> Result<T, HavenError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, HavenError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HavenError::storage(region.name(), format!("store task failed: {e}")))?
}

#[async_trait]
impl DurableStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, region: StoreRegion, key: &str) -> Result<Option<JsonValue>, HavenError> {
        Ok(self.read(region).await?.remove(key))
    }

    async fn put(&self, region: StoreRegion, key: &str, value: JsonValue) -> Result<(), HavenError> {
        let key = key.to_string();
        self.modify(region, move |doc| {
            doc.insert(key, value);
        })
        .await
    }

    async fn delete(&self, region: StoreRegion, key: &str) -> Result<bool, HavenError> {
        let key = key.to_string();
        self.modify(region, move |doc| doc.remove(&key).is_some()).await
    }

    async fn list(&self, region: StoreRegion) -> Result<Vec<(String, JsonValue)>, HavenError> {
        Ok(self.read(region).await?.into_iter().collect())
    }

    async fn clear(&self, region: StoreRegion) -> Result<usize, HavenError> {
        self.modify(region, |doc| {
            let n = doc.len();
            doc.clear();
            n
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_core::CacheRegion;
    use serde_json::json;

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .put(StoreRegion::CacheEntries(CacheRegion::Image), "k", json!({"a": 1}))
                .await
                .unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        let value = store
            .get(StoreRegion::CacheEntries(CacheRegion::Image), "k")
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"a": 1})));
        assert!(dir.path().join("cacheEntries-image.json").exists());
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let writes = (0..20).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .put(StoreRegion::OfflineQueue, &format!("{i:020}"), json!(i))
                    .await
            })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.list(StoreRegion::OfflineQueue).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("errorLog.json"), b"{not json").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let result = store.get(StoreRegion::ErrorLog, "ring").await;
        assert!(matches!(result, Err(HavenError::Storage { .. })));
    }
}
