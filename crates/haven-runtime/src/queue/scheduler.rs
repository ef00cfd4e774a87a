//! Background driver for queue drains and cache sweeps.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::OfflineQueue;
use crate::cache::CacheStore;
use crate::reporting::ErrorReporter;

/// Runs drains when connectivity returns, on a timer and on demand.
/// Also sweeps the cache and writes out new error log entries
/// periodically.
pub struct SyncScheduler {
    queue: OfflineQueue,
    cache: Option<Arc<CacheStore>>,
    reporter: Option<Arc<ErrorReporter>>,
    drain_interval: Duration,
    sweep_interval: Duration,
    flush_interval: Duration,
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a drain now.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the loop and wait for the current cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync scheduler ended abnormally");
        }
    }
}

impl SyncScheduler {
    pub fn new(queue: OfflineQueue) -> Self {
        let drain_interval = queue.config().drain_interval;
        Self {
            queue,
            cache: None,
            reporter: None,
            drain_interval,
            sweep_interval: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(30),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.sweep_interval = cache.config().sweep_interval;
        self.cache = Some(cache);
        self
    }

    /// Flush `reporter` every `interval` when it has new entries.
    pub fn with_reporter(mut self, reporter: Arc<ErrorReporter>, interval: Duration) -> Self {
        self.reporter = Some(reporter);
        self.flush_interval = interval;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let trigger = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(trigger.clone(), shutdown_rx));
        SchedulerHandle {
            trigger,
            shutdown,
            task,
        }
    }

    async fn run(self, trigger: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.queue.connectivity().subscribe();
        let mut drain_tick = ticker(self.drain_interval);
        let mut sweep_tick = ticker(self.sweep_interval);
        let mut flush_tick = ticker(self.flush_interval);
        tracing::debug!(
            drain_interval = ?self.drain_interval,
            sweep_interval = ?self.sweep_interval,
            flush_interval = ?self.flush_interval,
            "Sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online.borrow_and_update() {
                        self.drain("connectivity-restored").await;
                    }
                }
                _ = drain_tick.tick() => self.drain("interval").await,
                _ = trigger.notified() => self.drain("manual").await,
                _ = sweep_tick.tick() => self.sweep().await,
                _ = flush_tick.tick() => self.flush_errors().await,
            }
        }
        tracing::debug!("Sync scheduler stopped");
    }

    async fn drain(&self, reason: &str) {
        match self.queue.drain().await {
            Ok(report) => {
                tracing::debug!(reason, synced = report.synced, remaining = report.remaining, "Scheduled drain done");
            }
            Err(e) => tracing::error!(reason, error = %e, "Scheduled drain failed"),
        }
    }

    async fn sweep(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.sweep().await {
            tracing::warn!(error = %e, "Cache sweep failed");
        }
    }

    async fn flush_errors(&self) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        if let Err(e) = reporter.flush_pending().await {
            tracing::warn!(error = %e, "Error log flush failed");
        }
    }
}

/// Interval whose first tick is one period away.
fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
