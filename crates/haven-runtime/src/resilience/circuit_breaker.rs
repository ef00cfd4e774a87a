//! Per-dependency circuit breakers.
//!
//! When calls to a dependency fail repeatedly its circuit opens and
//! subsequent calls fail fast until the open timeout has elapsed since the
//! last failure. The next call then probes; enough probe successes close
//! the circuit, any probe failure reopens it.

use haven_core::{
    Admission, CircuitBreakerConfig, CircuitState, Clock, HavenError, ServiceHealthRecord,
    Transition,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::{EventBus, HavenEvent};

/// Registry of circuits, one per dependency name, created lazily.
pub struct CircuitBreakerRegistry {
    records: RwLock<HashMap<String, ServiceHealthRecord>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            config,
            clock,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Ask to call `service`.
    ///
    /// Returns a permit that must be settled with the call's outcome, or
    /// a `ServiceUnavailable` error when the circuit rejects the call.
    pub fn admit(&self, service: &str) -> Result<CallPermit<'_>, HavenError> {
        let now = self.clock.now();
        let (admission, transition) = {
            let mut records = self.records.write();
            let record = records
                .entry(service.to_string())
                .or_insert_with(|| ServiceHealthRecord::new(service, &self.config.for_service(service)));
            record.admit(now)
        };
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
        match admission {
            Admission::Allowed => Ok(CallPermit::new(self, service, false)),
            Admission::Probe => Ok(CallPermit::new(self, service, true)),
            Admission::Rejected { retry_after } => {
                tracing::debug!(service, ?retry_after, "Circuit rejected call");
                Err(HavenError::circuit_open(service, retry_after))
            }
        }
    }

    fn record_success(&self, service: &str, probe: bool) -> Option<Transition> {
        let transition = self
            .records
            .write()
            .get_mut(service)
            .and_then(|record| record.record_success(probe));
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
        transition
    }

    fn record_failure(&self, service: &str, probe: bool) -> Option<Transition> {
        let now = self.clock.now();
        let transition = self
            .records
            .write()
            .get_mut(service)
            .and_then(|record| record.record_failure(now, probe));
        if let Some(transition) = transition {
            self.announce(service, transition);
        }
        transition
    }

    fn release_probe(&self, service: &str) {
        if let Some(record) = self.records.write().get_mut(service) {
            record.release_probe();
        }
    }

    fn announce(&self, service: &str, transition: Transition) {
        match transition {
            Transition::Opened { failures } => {
                tracing::warn!(service, failures, "Circuit opened after repeated failures");
                self.emit(HavenEvent::CircuitOpened {
                    service: service.to_string(),
                    failures,
                });
            }
            Transition::HalfOpened => {
                tracing::info!(service, "Circuit half-open, probing for recovery");
            }
            Transition::Closed => {
                tracing::info!(service, "Circuit closed after successful recovery");
                self.emit(HavenEvent::CircuitClosed {
                    service: service.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: HavenEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    /// Current state; unknown services are closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.records
            .read()
            .get(service)
            .map_or(CircuitState::Closed, |r| r.state)
    }

    pub fn snapshot(&self, service: &str) -> Option<ServiceHealthRecord> {
        self.records.read().get(service).cloned()
    }

    /// Every known circuit, sorted by service name.
    pub fn snapshots(&self) -> Vec<ServiceHealthRecord> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Load persisted records. Thresholds and timeouts come from the
    /// current configuration, not from the snapshot.
    pub fn restore(&self, records: impl IntoIterator<Item = ServiceHealthRecord>) -> usize {
        let mut current = self.records.write();
        let mut restored = 0;
        for mut record in records {
            let config = self.config.for_service(&record.service);
            record.failure_threshold = config.failure_threshold.max(1);
            record.half_open_success_threshold = config.half_open_success_threshold.max(1);
            record.open_timeout = config.open_timeout;
            record.probe_in_flight = false;
            current.insert(record.service.clone(), record);
            restored += 1;
        }
        restored
    }

    /// Forget every circuit.
    pub fn reset(&self) {
        self.records.write().clear();
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("services", &self.records.read().len())
            .field("config", &self.config)
            .finish()
    }
}

/// Admission to call a dependency once.
///
/// Settle it with [`succeed`](Self::succeed), [`fail`](Self::fail) or
/// [`abandon`](Self::abandon). A permit dropped unsettled (the caller was
/// cancelled mid-call) counts as a failure.
#[must_use = "a permit dropped without an outcome counts as a failure"]
pub struct CallPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    service: String,
    probe: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(registry: &'a CircuitBreakerRegistry, service: &str, probe: bool) -> Self {
        Self {
            registry,
            service: service.to_string(),
            probe,
            settled: false,
        }
    }

    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn succeed(mut self) -> Option<Transition> {
        self.settled = true;
        self.registry.record_success(&self.service, self.probe)
    }

    pub fn fail(mut self) -> Option<Transition> {
        self.settled = true;
        self.registry.record_failure(&self.service, self.probe)
    }

    /// The outcome says nothing about the dependency's health
    /// (e.g. the request itself was invalid).
    pub fn abandon(mut self) {
        self.settled = true;
        if self.probe {
            self.registry.release_probe(&self.service);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(service = %self.service, "Call dropped before settling, counting as failure");
            self.registry.record_failure(&self.service, self.probe);
        }
    }
}
