//! Bounded error reporting.
//!
//! Every handled error is recorded here before it propagates. Recording
//! is synchronous and in memory; `flush` writes the ring to the
//! `errorLog` region so the CLI and later sessions can read it.

use haven_core::{Clock, ErrorLog, ErrorLogEntry, HavenError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::store::{StoreGuard, StoreRegion};

/// Key of the single ring document in the `errorLog` region.
pub const ERROR_LOG_KEY: &str = "ring";

pub struct ErrorReporter {
    log: Mutex<ErrorLog>,
    clock: Arc<dyn Clock>,
    store: Option<StoreGuard>,
    /// Entries recorded so far, and how many of them the last flush saw
    recorded: AtomicU64,
    flushed: AtomicU64,
}

impl ErrorReporter {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            log: Mutex::new(ErrorLog::new(capacity)),
            clock,
            store: None,
            recorded: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: StoreGuard) -> Self {
        self.store = Some(store);
        self
    }

    /// Record a handled error with context pairs.
    pub fn record(&self, error: &HavenError, context: &[(&str, &str)]) -> ErrorLogEntry {
        let context: BTreeMap<String, String> = context
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let entry = ErrorLogEntry::new(error, context, self.clock.now());
        tracing::debug!(kind = %entry.kind, error = %error, "Recorded handled error");
        {
            let mut log = self.log.lock();
            if let Some(evicted) = log.push(entry.clone()) {
                tracing::trace!(id = %evicted.id, "Evicted oldest error log entry");
            }
            self.recorded.fetch_add(1, Ordering::AcqRel);
        }
        entry
    }

    /// Newest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorLogEntry> {
        self.log.lock().recent(n)
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    /// Persist the ring. A no-op without a store.
    pub async fn flush(&self) -> Result<(), HavenError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let (entries, generation): (Vec<ErrorLogEntry>, u64) = {
            let log = self.log.lock();
            (log.entries().cloned().collect(), self.recorded.load(Ordering::Acquire))
        };
        store
            .put(StoreRegion::ErrorLog, ERROR_LOG_KEY, &entries)
            .await?;
        self.flushed.fetch_max(generation, Ordering::AcqRel);
        Ok(())
    }

    /// Whether entries were recorded since the last successful flush.
    pub fn has_unflushed(&self) -> bool {
        self.recorded.load(Ordering::Acquire) > self.flushed.load(Ordering::Acquire)
    }

    /// Flush only if something new was recorded. Returns whether it wrote.
    pub async fn flush_pending(&self) -> Result<bool, HavenError> {
        if self.store.is_none() || !self.has_unflushed() {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Reload the persisted ring, keeping anything recorded since start.
    pub async fn restore(&self) -> Result<usize, HavenError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted: Vec<ErrorLogEntry> = store
            .get(StoreRegion::ErrorLog, ERROR_LOG_KEY)
            .await?
            .unwrap_or_default();
        let restored = persisted.len();
        let mut log = self.log.lock();
        let current: Vec<ErrorLogEntry> = log.entries().cloned().collect();
        *log = ErrorLog::from_entries(log.capacity(), persisted.into_iter().chain(current));
        Ok(restored)
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("entries", &self.len())
            .field("store", &self.store)
            .finish()
    }
}
