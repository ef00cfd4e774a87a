//! Offline operation queue.
//!
//! Writes made while the device is offline (or while their dependency is
//! failing) are recorded durably and replayed in FIFO order once the
//! network is back. Operations on the same record are never reordered:
//! if an earlier one is still pending after a failure, or has failed,
//! every later operation on that record waits.

mod ledger;
mod scheduler;

pub use ledger::QueueLedger;
pub use scheduler::{SchedulerHandle, SyncScheduler};

use haven_core::{
    Clock, HavenError, OperationDraft, OperationKind, OperationStatus, QueueConfig,
    QueuedOperation, SystemClock,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::connectivity::ConnectivityMonitor;
use crate::events::{EventBus, HavenEvent};
use crate::network::{Method, NetworkClient, NetworkRequest};
use crate::resilience::{CallOptions, Resilience};
use crate::store::StoreGuard;

/// Breaker and limiter key for replayed writes.
pub const SYNC_SERVICE: &str = "sync";

pub const DEFAULT_SYNC_ENDPOINT: &str = "http://localhost/api";

/// What happened to a submitted write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Applied upstream immediately
    Applied,
    /// Recorded for later replay
    Queued(QueuedOperation),
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued(_))
    }
}

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainSkip {
    AlreadyRunning,
    Offline,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Replays that reached the network
    pub attempted: usize,
    pub synced: usize,
    /// Operations that became `failed` this cycle
    pub failed: usize,
    /// Operations that failed but stay pending
    pub deferred: usize,
    /// Pending operations held back by an earlier one on the same record
    pub blocked: usize,
    /// Pending operations left after the cycle
    pub remaining: usize,
    /// The sync circuit or budget stopped the cycle early
    pub halted: bool,
    pub skipped: Option<DrainSkip>,
}

impl DrainReport {
    fn skipped(reason: DrainSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Selects operations for [`OfflineQueue::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilter {
    pub status: Option<OperationStatus>,
    pub collection: Option<String>,
}

impl QueueFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn matches(&self, op: &QueuedOperation) -> bool {
        self.status.map_or(true, |s| op.status == s)
            && self.collection.as_deref().map_or(true, |c| op.collection == c)
    }
}

/// Durable FIFO of deferred writes.
///
/// Cloning shares the queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    ledger: QueueLedger,
    /// In-memory mirror of the ledger, updated only after a durable write
    ops: Mutex<BTreeMap<u64, QueuedOperation>>,
    next_sequence: AtomicU64,
    draining: AtomicBool,
    network: Arc<dyn NetworkClient>,
    resilience: Resilience,
    connectivity: ConnectivityMonitor,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    endpoint: String,
}

/// Builder for [`OfflineQueue`].
pub struct OfflineQueueBuilder {
    store: StoreGuard,
    network: Arc<dyn NetworkClient>,
    resilience: Resilience,
    config: QueueConfig,
    endpoint: String,
    events: EventBus,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
}

impl OfflineQueueBuilder {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Base URL that collections hang off.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load the persisted queue and make it ready for use.
    ///
    /// Operations left in flight by an interrupted session go back to
    /// pending.
    pub async fn open(self) -> Result<OfflineQueue, HavenError> {
        let ledger = QueueLedger::new(self.store);
        let mut ops = BTreeMap::new();
        let mut recovered = 0;
        for mut op in ledger.load().await? {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                ledger.save(&op).await?;
                recovered += 1;
            }
            ops.insert(op.sequence, op);
        }
        let next = ops.keys().next_back().map_or(1, |seq| seq + 1);
        tracing::info!(
            operations = ops.len(),
            recovered,
            "Offline queue restored"
        );

        Ok(OfflineQueue {
            inner: Arc::new(QueueInner {
                ledger,
                ops: Mutex::new(ops),
                next_sequence: AtomicU64::new(next),
                draining: AtomicBool::new(false),
                network: self.network,
                resilience: self.resilience,
                connectivity: self.connectivity,
                events: self.events,
                clock: self.clock,
                config: self.config,
                endpoint: self.endpoint,
            }),
        })
    }
}

/// Clears the drain flag when a cycle ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    pub fn builder(
        store: StoreGuard,
        network: Arc<dyn NetworkClient>,
        resilience: Resilience,
    ) -> OfflineQueueBuilder {
        OfflineQueueBuilder {
            store,
            network,
            resilience,
            config: QueueConfig::default(),
            endpoint: DEFAULT_SYNC_ENDPOINT.to_string(),
            events: EventBus::default(),
            connectivity: ConnectivityMonitor::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    /// Durably record a write for later replay.
    pub async fn enqueue(&self, draft: OperationDraft) -> Result<QueuedOperation, HavenError> {
        self.validate(&draft)?;
        self.record(draft, None).await
    }

    /// Apply a write now if possible, otherwise queue it.
    ///
    /// A write goes straight to the network only when the device is online
    /// and nothing is queued for the same record. A direct call that fails
    /// with anything but invalid input or a conflict is queued instead.
    pub async fn submit(&self, draft: OperationDraft) -> Result<WriteOutcome, HavenError> {
        self.validate(&draft)?;

        let record_key = format!("{}/{}", draft.collection, draft.record_id);
        if !self.inner.connectivity.is_online() {
            tracing::debug!(record = %record_key, "Offline, queueing write");
            return self.record(draft, None).await.map(WriteOutcome::Queued);
        }
        if self.has_unsynced(&record_key).await {
            tracing::debug!(record = %record_key, "Earlier writes still queued, queueing behind them");
            return self.record(draft, None).await.map(WriteOutcome::Queued);
        }

        let probe = QueuedOperation::from_draft(
            draft.clone(),
            0,
            self.inner.config.max_attempts,
            self.inner.clock.now(),
        );
        match self.replay(&probe).await {
            Ok(()) => Ok(WriteOutcome::Applied),
            Err(err) if err.is_terminal() => Err(err),
            Err(err) => {
                tracing::info!(record = %record_key, error = %err, "Direct write failed, queueing");
                self.record(draft, Some(err.to_string()))
                    .await
                    .map(WriteOutcome::Queued)
            }
        }
    }

    /// Replay pending operations in FIFO order.
    ///
    /// At most one drain runs at a time; a call made while another is
    /// active returns immediately with [`DrainSkip::AlreadyRunning`].
    pub async fn drain(&self) -> Result<DrainReport, HavenError> {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return Ok(DrainReport::skipped(DrainSkip::AlreadyRunning));
        }
        let _guard = DrainGuard(&self.inner.draining);

        if !self.inner.connectivity.is_online() {
            tracing::debug!("Offline, skipping drain");
            return Ok(DrainReport::skipped(DrainSkip::Offline));
        }

        self.release_stranded().await?;
        self.prune_synced().await?;
        let snapshot: Vec<QueuedOperation> =
            self.inner.ops.lock().await.values().cloned().collect();

        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;

        for op in snapshot {
            let key = op.record_key();
            match op.status {
                OperationStatus::Failed => {
                    blocked.insert(key);
                    continue;
                }
                OperationStatus::Synced | OperationStatus::InFlight => continue,
                OperationStatus::Pending => {}
            }
            if blocked.contains(&key) {
                report.blocked += 1;
                continue;
            }

            let Some(op) = self.transition(op.sequence, |op| {
                op.status = OperationStatus::InFlight;
            })
            .await?
            else {
                // Discarded while the drain was running
                continue;
            };

            let outcome = self.replay(&op).await;
            let now = self.inner.clock.now();
            match outcome {
                Ok(()) => {
                    self.transition(op.sequence, |op| {
                        op.status = OperationStatus::Synced;
                        op.synced_at = Some(now);
                        op.last_error = None;
                    })
                    .await?;
                    report.attempted += 1;
                    report.synced += 1;
                    tracing::info!(op_id = %op.id, record = %key, "Operation synced");
                }
                Err(err)
                    if err.is_circuit_open()
                        || matches!(err.root(), HavenError::RateLimited { .. }) =>
                {
                    // Not an attempt; try again next cycle
                    self.transition(op.sequence, |op| {
                        op.status = OperationStatus::Pending;
                    })
                    .await?;
                    tracing::info!(error = %err, "Sync halted");
                    last_error = Some(err.to_string());
                    report.halted = true;
                    break;
                }
                Err(err) => {
                    let terminal = err.is_terminal();
                    let message = err.to_string();
                    let updated = self
                        .transition(op.sequence, |op| {
                            op.attempts += 1;
                            op.last_error = Some(message.clone());
                            op.status = if terminal || op.attempts >= op.max_attempts {
                                OperationStatus::Failed
                            } else {
                                OperationStatus::Pending
                            };
                        })
                        .await?;
                    report.attempted += 1;
                    match updated {
                        Some(op) if op.status == OperationStatus::Failed => {
                            report.failed += 1;
                            tracing::warn!(
                                op_id = %op.id,
                                record = %key,
                                attempts = op.attempts,
                                error = %message,
                                "Operation failed permanently"
                            );
                        }
                        Some(op) => {
                            report.deferred += 1;
                            tracing::debug!(op_id = %op.id, attempts = op.attempts, error = %message, "Replay failed, will retry");
                        }
                        None => {}
                    }
                    blocked.insert(key);
                    last_error = Some(message);
                }
            }
        }

        self.prune_synced().await?;
        report.remaining = self.pending_count().await;
        self.announce(&report, last_error);
        Ok(report)
    }

    fn announce(&self, report: &DrainReport, last_error: Option<String>) {
        if report.attempted == 0 && !report.halted {
            return;
        }
        let event = if report.failed == 0 && report.remaining == 0 {
            HavenEvent::SyncCompleted {
                synced: report.synced,
            }
        } else {
            HavenEvent::SyncFailed {
                synced: report.synced,
                failed: report.failed,
                remaining: report.remaining,
                reason: last_error.unwrap_or_else(|| "operations remain pending".to_string()),
            }
        };
        tracing::info!(
            synced = report.synced,
            failed = report.failed,
            remaining = report.remaining,
            "Drain finished"
        );
        self.inner.events.emit(event);
    }

    /// Current state of an operation, if it is still on record.
    pub async fn status(&self, id: Uuid) -> Option<QueuedOperation> {
        self.inner
            .ops
            .lock()
            .await
            .values()
            .find(|op| op.id == id)
            .cloned()
    }

    /// Operations matching `filter`, oldest first.
    pub async fn list(&self, filter: &QueueFilter) -> Vec<QueuedOperation> {
        self.inner
            .ops
            .lock()
            .await
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner
            .ops
            .lock()
            .await
            .values()
            .filter(|op| op.is_replayable())
            .count()
    }

    /// Put a failed operation back into automatic replay.
    pub async fn retry_failed(&self, id: Uuid) -> Result<QueuedOperation, HavenError> {
        let mut ops = self.inner.ops.lock().await;
        let mut op = ops
            .values()
            .find(|op| op.id == id)
            .cloned()
            .ok_or_else(|| ledger::not_found(id))?;
        ledger::reset_for_retry(&mut op)?;
        self.inner.ledger.save(&op).await?;
        ops.insert(op.sequence, op.clone());
        tracing::info!(op_id = %id, "Failed operation requeued");
        Ok(op)
    }

    /// Drop one operation. Returns whether it existed.
    pub async fn discard(&self, id: Uuid) -> Result<bool, HavenError> {
        let mut ops = self.inner.ops.lock().await;
        let Some(sequence) = ops.values().find(|op| op.id == id).map(|op| op.sequence) else {
            return Ok(false);
        };
        self.inner.ledger.remove(sequence).await?;
        ops.remove(&sequence);
        tracing::info!(op_id = %id, "Operation discarded");
        Ok(true)
    }

    /// Drop every operation targeting `collection`.
    pub async fn purge_collection(&self, collection: &str) -> Result<usize, HavenError> {
        self.purge_where(|op| op.collection == collection).await
    }

    pub async fn purge_all(&self) -> Result<usize, HavenError> {
        self.purge_where(|_| true).await
    }

    /// Remove synced operations older than the grace period.
    pub async fn prune_synced(&self) -> Result<usize, HavenError> {
        let now = self.inner.clock.now();
        let grace = self.inner.config.synced_grace;
        self.purge_where(|op| {
            op.status == OperationStatus::Synced
                && op.synced_at.map_or(true, |at| {
                    now.signed_duration_since(at).to_std().unwrap_or_default() >= grace
                })
        })
        .await
    }

    async fn purge_where(
        &self,
        predicate: impl Fn(&QueuedOperation) -> bool,
    ) -> Result<usize, HavenError> {
        let mut ops = self.inner.ops.lock().await;
        let doomed: Vec<u64> = ops
            .values()
            .filter(|op| predicate(op))
            .map(|op| op.sequence)
            .collect();
        for sequence in &doomed {
            self.inner.ledger.remove(*sequence).await?;
            ops.remove(sequence);
        }
        if !doomed.is_empty() {
            tracing::debug!(removed = doomed.len(), "Removed queued operations");
        }
        Ok(doomed.len())
    }

    fn validate(&self, draft: &OperationDraft) -> Result<(), HavenError> {
        draft.validate().map_err(|err| {
            self.inner.resilience.reporter().record(
                &err,
                &[
                    ("collection", draft.collection.as_str()),
                    ("record_id", draft.record_id.as_str()),
                ],
            );
            err
        })
    }

    /// Put operations a previous drain left in flight back to pending.
    ///
    /// A drain that stops on a store error after marking an operation in
    /// flight leaves it there. Only one drain runs at a time, so while
    /// the drain flag is held nothing is legitimately in flight.
    async fn release_stranded(&self) -> Result<(), HavenError> {
        let mut ops = self.inner.ops.lock().await;
        for op in ops.values_mut() {
            if op.status != OperationStatus::InFlight {
                continue;
            }
            tracing::warn!(op_id = %op.id, record = %op.record_key(), "Releasing operation left in flight");
            // Restore reads a persisted in-flight status as pending too.
            op.status = OperationStatus::Pending;
            self.inner.ledger.save(op).await?;
        }
        Ok(())
    }

    async fn has_unsynced(&self, record_key: &str) -> bool {
        self.inner.ops.lock().await.values().any(|op| {
            matches!(
                op.status,
                OperationStatus::Pending | OperationStatus::InFlight | OperationStatus::Failed
            ) && op.record_key() == record_key
        })
    }

    /// Persist a new operation, then publish it.
    async fn record(
        &self,
        draft: OperationDraft,
        last_error: Option<String>,
    ) -> Result<QueuedOperation, HavenError> {
        let mut ops = self.inner.ops.lock().await;
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::SeqCst);
        let mut op = QueuedOperation::from_draft(
            draft,
            sequence,
            self.inner.config.max_attempts,
            self.inner.clock.now(),
        );
        op.last_error = last_error;

        if let Err(err) = self.inner.ledger.save(&op).await {
            tracing::error!(record = %op.record_key(), error = %err, "Could not queue write");
            self.inner.resilience.reporter().record(
                &err,
                &[("collection", op.collection.as_str()), ("record_id", op.record_id.as_str())],
            );
            return Err(err);
        }
        ops.insert(sequence, op.clone());
        let pending = ops.values().filter(|o| o.is_replayable()).count();
        drop(ops);

        tracing::info!(
            op_id = %op.id,
            kind = %op.kind,
            record = %op.record_key(),
            pending,
            "Write queued"
        );
        self.inner.events.emit(HavenEvent::queued(&op, pending));
        Ok(op)
    }

    /// Apply `change` to an operation, persist it, then update the mirror.
    async fn transition(
        &self,
        sequence: u64,
        change: impl FnOnce(&mut QueuedOperation),
    ) -> Result<Option<QueuedOperation>, HavenError> {
        let mut ops = self.inner.ops.lock().await;
        let Some(mut op) = ops.get(&sequence).cloned() else {
            return Ok(None);
        };
        change(&mut op);
        self.inner.ledger.save(&op).await?;
        ops.insert(sequence, op.clone());
        Ok(Some(op))
    }

    fn request_for(&self, op: &QueuedOperation) -> NetworkRequest {
        let collection_url = format!("{}/{}", self.inner.endpoint, op.collection);
        let request = match op.kind {
            OperationKind::Create => NetworkRequest::get(collection_url)
                .with_method(Method::Post)
                .with_json(op.payload.clone()),
            OperationKind::Update => {
                NetworkRequest::get(format!("{collection_url}/{}", op.record_id))
                    .with_method(Method::Put)
                    .with_json(op.payload.clone())
            }
            OperationKind::Delete => {
                NetworkRequest::get(format!("{collection_url}/{}", op.record_id))
                    .with_method(Method::Delete)
            }
        };
        request.with_header("Idempotency-Key", op.id.to_string())
    }

    /// Send one operation through the protected-call path.
    async fn replay(&self, op: &QueuedOperation) -> Result<(), HavenError> {
        let request = self.request_for(op);
        let options = CallOptions::default()
            .with_context("op_id", op.id.to_string())
            .with_context("record", op.record_key());
        let network = self.inner.network.clone();
        let kind = op.kind;
        let collection = op.collection.as_str();
        let record_id = op.record_id.as_str();

        self.inner
            .resilience
            .execute(SYNC_SERVICE, &options, move || {
                let network = network.clone();
                let request = request.clone();
                async move {
                    let response = network.send(request).await?;
                    match response.status {
                        409 | 412 => Err(HavenError::SyncConflict {
                            collection: collection.to_string(),
                            record_id: record_id.to_string(),
                            message: format!("remote rejected replay with {}", response.status),
                        }),
                        // Already gone upstream
                        404 | 410 if kind == OperationKind::Delete => Ok(()),
                        _ => response.into_success(SYNC_SERVICE).map(|_| ()),
                    }
                }
            })
            .await
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("endpoint", &self.inner.endpoint)
            .field("config", &self.inner.config)
            .field("draining", &self.inner.draining.load(Ordering::Relaxed))
            .finish()
    }
}
