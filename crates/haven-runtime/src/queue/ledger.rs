//! Durable record of queued operations in the `offlineQueue` region.
//!
//! Keys are zero-padded sequence numbers, so key order is FIFO order.
//! The ledger works directly on the store, which lets the CLI inspect
//! and repair a queue without a running engine.

use haven_core::{HavenError, OperationStatus, QueuedOperation};
use uuid::Uuid;

use crate::store::{StoreGuard, StoreRegion};

pub(crate) fn sequence_key(sequence: u64) -> String {
    format!("{sequence:020}")
}

#[derive(Debug, Clone)]
pub struct QueueLedger {
    store: StoreGuard,
}

impl QueueLedger {
    pub fn new(store: StoreGuard) -> Self {
        Self { store }
    }

    /// Every operation, oldest first. Undecodable records are skipped
    /// and left in place for inspection.
    pub async fn load(&self) -> Result<Vec<QueuedOperation>, HavenError> {
        let raw = self.store.list_raw(StoreRegion::OfflineQueue).await?;
        let mut ops: Vec<QueuedOperation> = raw
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(op) => Some(op),
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Skipping undecodable queued operation");
                    None
                }
            })
            .collect();
        ops.sort_by_key(|op| op.sequence);
        Ok(ops)
    }

    pub async fn save(&self, op: &QueuedOperation) -> Result<(), HavenError> {
        self.store
            .put(StoreRegion::OfflineQueue, &sequence_key(op.sequence), op)
            .await
    }

    pub async fn remove(&self, sequence: u64) -> Result<bool, HavenError> {
        self.store
            .delete(StoreRegion::OfflineQueue, &sequence_key(sequence))
            .await
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<QueuedOperation>, HavenError> {
        Ok(self.load().await?.into_iter().find(|op| op.id == id))
    }

    /// Put a failed operation back into automatic replay.
    pub async fn retry(&self, id: Uuid) -> Result<QueuedOperation, HavenError> {
        let mut op = self.find(id).await?.ok_or_else(|| not_found(id))?;
        reset_for_retry(&mut op)?;
        self.save(&op).await?;
        Ok(op)
    }

    /// Remove every operation, or those targeting `collection`.
    pub async fn purge(&self, collection: Option<&str>) -> Result<usize, HavenError> {
        let mut removed = 0;
        for op in self.load().await? {
            if collection.map_or(true, |c| op.collection == c) && self.remove(op.sequence).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// One past the highest sequence on record.
    pub async fn next_sequence(&self) -> Result<u64, HavenError> {
        Ok(self
            .load()
            .await?
            .last()
            .map_or(1, |op| op.sequence + 1))
    }
}

pub(crate) fn not_found(id: Uuid) -> HavenError {
    HavenError::validation(
        format!("no queued operation with id {id}"),
        "list the queue to find current operation ids",
    )
}

pub(crate) fn reset_for_retry(op: &mut QueuedOperation) -> Result<(), HavenError> {
    if op.status != OperationStatus::Failed {
        return Err(HavenError::validation(
            format!("operation {} is {}, not failed", op.id, op.status),
            "only failed operations can be retried manually",
        ));
    }
    op.status = OperationStatus::Pending;
    op.attempts = 0;
    op.last_error = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use haven_core::{OperationDraft, OperationKind};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ledger() -> QueueLedger {
        QueueLedger::new(StoreGuard::new(Arc::new(MemoryStore::new()), Duration::from_secs(5)))
    }

    fn op(seq: u64, collection: &str) -> QueuedOperation {
        QueuedOperation::from_draft(
            OperationDraft::new(OperationKind::Create, collection, format!("r{seq}"), json!({})),
            seq,
            5,
            Utc::now(),
        )
    }

    #[test]
    fn test_sequence_keys_sort_numerically() {
        assert!(sequence_key(9) < sequence_key(10));
        assert!(sequence_key(99) < sequence_key(100));
    }

    #[tokio::test]
    async fn test_load_is_fifo() {
        let ledger = ledger();
        ledger.save(&op(10, "sleep-logs")).await.unwrap();
        ledger.save(&op(2, "sleep-logs")).await.unwrap();
        let seqs: Vec<_> = ledger.load().await.unwrap().iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![2, 10]);
        assert_eq!(ledger.next_sequence().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let ledger = ledger();
        let mut failed = op(1, "meals");
        failed.status = OperationStatus::Failed;
        failed.attempts = 5;
        ledger.save(&failed).await.unwrap();
        let pending = op(2, "meals");
        ledger.save(&pending).await.unwrap();

        let retried = ledger.retry(failed.id).await.unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert!(ledger.retry(pending.id).await.is_err());
        assert!(ledger.retry(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_by_collection() {
        let ledger = ledger();
        ledger.save(&op(1, "meals")).await.unwrap();
        ledger.save(&op(2, "sleep-logs")).await.unwrap();
        assert_eq!(ledger.purge(Some("meals")).await.unwrap(), 1);
        assert_eq!(ledger.load().await.unwrap().len(), 1);
        assert_eq!(ledger.purge(None).await.unwrap(), 1);
    }
}
