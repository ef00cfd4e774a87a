//! Data model persisted in the durable store.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::clock::elapsed;
use crate::config::{duration, CircuitBreakerConfig};
use crate::error::{ErrorKind, HavenError};

// =========================================================================
// SERVICE HEALTH
// =========================================================================

/// State of a dependency's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast until the open timeout elapses
    Open,
    /// One probe at a time is testing recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds normally
    Allowed,
    /// This call is the single half-open probe
    Probe,
    /// Fail fast
    Rejected { retry_after: Duration },
}

/// A state change worth announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { failures: u32 },
    HalfOpened,
    Closed,
}

/// Health of one upstream dependency.
///
/// The record is a pure state machine; callers supply the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub success_count_in_half_open: u32,
    pub half_open_success_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(with = "duration::millis")]
    pub open_timeout: Duration,

    /// Not persisted: a restored half-open circuit has no probe running.
    #[serde(skip)]
    pub probe_in_flight: bool,
}

impl ServiceHealthRecord {
    /// A closed circuit for `service`.
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: config.failure_threshold.max(1),
            success_count_in_half_open: 0,
            half_open_success_threshold: config.half_open_success_threshold.max(1),
            last_failure_at: None,
            open_timeout: config.open_timeout,
            probe_in_flight: false,
        }
    }

    /// Decide whether a call may run at `now`.
    ///
    /// The first call after the open timeout moves the circuit to
    /// half-open and becomes the probe.
    pub fn admit(&mut self, now: DateTime<Utc>) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                let since = self
                    .last_failure_at
                    .map(|at| elapsed(now, at))
                    .unwrap_or(self.open_timeout);
                if since >= self.open_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.success_count_in_half_open = 0;
                    self.probe_in_flight = true;
                    (Admission::Probe, Some(Transition::HalfOpened))
                } else {
                    (
                        Admission::Rejected {
                            retry_after: self.open_timeout - since,
                        },
                        None,
                    )
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    (
                        Admission::Rejected {
                            retry_after: Duration::ZERO,
                        },
                        None,
                    )
                } else {
                    self.probe_in_flight = true;
                    (Admission::Probe, None)
                }
            }
        }
    }

    /// Record a successful call. `probe` is true when the call was
    /// admitted as the half-open probe.
    ///
    /// While half-open only the probe's outcome counts; a call admitted
    /// before the circuit opened may still finish late.
    pub fn record_success(&mut self, probe: bool) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen if probe => {
                self.probe_in_flight = false;
                self.success_count_in_half_open += 1;
                if self.success_count_in_half_open >= self.half_open_success_threshold {
                    self.close();
                    Some(Transition::Closed)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }

    /// Record a failed call at `now`.
    pub fn record_failure(&mut self, now: DateTime<Utc>, probe: bool) -> Option<Transition> {
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    Some(Transition::Opened {
                        failures: self.failure_count,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if probe => {
                self.state = CircuitState::Open;
                self.probe_in_flight = false;
                self.success_count_in_half_open = 0;
                self.failure_count += 1;
                Some(Transition::Opened {
                    failures: self.failure_count,
                })
            }
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                self.failure_count += 1;
                None
            }
        }
    }

    /// Release a probe slot without an outcome.
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count_in_half_open = 0;
        self.probe_in_flight = false;
    }
}

// =========================================================================
// CACHE
// =========================================================================

/// Named cache region in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRegion {
    Static,
    Dynamic,
    Image,
    Performance,
}

impl CacheRegion {
    pub const ALL: [CacheRegion; 4] = [
        CacheRegion::Static,
        CacheRegion::Dynamic,
        CacheRegion::Image,
        CacheRegion::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRegion::Static => "static",
            CacheRegion::Dynamic => "dynamic",
            CacheRegion::Image => "image",
            CacheRegion::Performance => "performance",
        }
    }
}

/// Expiration category; each has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheCategory {
    #[serde(rename = "static")]
    Static,
    #[serde(rename = "api/json")]
    ApiJson,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "other")]
    Other,
}

/// Class assigned to an outbound request by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Critical,
    Static,
    Api,
    Navigation,
    Image,
    Other,
}

/// Caching strategy applied to a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    StaleWhileRevalidate,
    NetworkFirst,
    CacheFirst,
}

impl ResourceClass {
    pub fn strategy(&self) -> CacheStrategy {
        match self {
            ResourceClass::Critical | ResourceClass::Static => CacheStrategy::StaleWhileRevalidate,
            ResourceClass::Image => CacheStrategy::CacheFirst,
            ResourceClass::Api | ResourceClass::Navigation | ResourceClass::Other => {
                CacheStrategy::NetworkFirst
            }
        }
    }

    pub fn region(&self) -> CacheRegion {
        match self {
            ResourceClass::Critical => CacheRegion::Performance,
            ResourceClass::Static => CacheRegion::Static,
            ResourceClass::Image => CacheRegion::Image,
            ResourceClass::Api | ResourceClass::Navigation | ResourceClass::Other => {
                CacheRegion::Dynamic
            }
        }
    }

    pub fn category(&self) -> CacheCategory {
        match self {
            ResourceClass::Critical | ResourceClass::Static => CacheCategory::Static,
            ResourceClass::Api => CacheCategory::ApiJson,
            ResourceClass::Image => CacheCategory::Image,
            ResourceClass::Navigation | ResourceClass::Other => CacheCategory::Other,
        }
    }

    /// Content type used to look up a substitute when nothing else is left.
    pub fn fallback_content_type(&self) -> &'static str {
        match self {
            ResourceClass::Api => "api/json",
            ResourceClass::Image => "image",
            ResourceClass::Navigation | ResourceClass::Critical => "document",
            ResourceClass::Static | ResourceClass::Other => "text",
        }
    }
}

/// What the collaborator says it is fetching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceHint {
    Navigate,
    Script,
    Style,
    Font,
    Image,
    Data,
    #[default]
    Other,
}

/// A cacheable read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRequest {
    pub url: String,
    #[serde(default)]
    pub resource_hint: ResourceHint,
}

impl CacheRequest {
    pub fn new(url: impl Into<String>, resource_hint: ResourceHint) -> Self {
        Self {
            url: url.into(),
            resource_hint,
        }
    }
}

/// A cached response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Normalized request identity
    pub key: String,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    #[serde(with = "duration::millis")]
    pub ttl: Duration,
    pub region: CacheRegion,
    pub category: CacheCategory,
    pub strategy: CacheStrategy,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(now, self.cached_at)
    }

    /// True once `cached_at + ttl < now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// =========================================================================
// OFFLINE QUEUE
// =========================================================================

/// Kind of mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// Replay status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
    Synced,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::InFlight => write!(f, "in-flight"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Synced => write!(f, "synced"),
        }
    }
}

/// A write a collaborator wants applied upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDraft {
    pub kind: OperationKind,
    pub collection: String,
    pub record_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl OperationDraft {
    pub fn new(
        kind: OperationKind,
        collection: impl Into<String>,
        record_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            record_id: record_id.into(),
            payload,
        }
    }

    /// Reject drafts that could never replay.
    pub fn validate(&self) -> Result<(), HavenError> {
        if self.collection.trim().is_empty() {
            return Err(HavenError::validation(
                "operation has no target collection",
                "set `collection` to the name of the upstream collection, e.g. \"sleep-logs\"",
            ));
        }
        if self.collection.contains('/') {
            return Err(HavenError::validation(
                format!("collection '{}' contains '/'", self.collection),
                "use a bare collection name without path separators",
            ));
        }
        if self.record_id.trim().is_empty() {
            return Err(HavenError::validation(
                "operation has no record id",
                "generate the record id on the device before queueing the write",
            ));
        }
        if self.kind != OperationKind::Delete && self.payload.is_null() {
            return Err(HavenError::validation(
                format!("{} on {}/{} has no payload", self.kind, self.collection, self.record_id),
                "include the record body for create and update operations",
            ));
        }
        Ok(())
    }
}

/// A durably recorded write awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    /// Monotonic position; defines FIFO order
    pub sequence: u64,
    pub kind: OperationKind,
    pub collection: String,
    pub record_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    pub fn from_draft(
        draft: OperationDraft,
        sequence: u64,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            kind: draft.kind,
            collection: draft.collection,
            record_id: draft.record_id,
            payload: draft.payload,
            created_at: now,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: OperationStatus::Pending,
            last_error: None,
            synced_at: None,
        }
    }

    /// Identity of the logical record this operation touches.
    pub fn record_key(&self) -> String {
        format!("{}/{}", self.collection, self.record_id)
    }

    /// Whether automatic drains should pick this up.
    pub fn is_replayable(&self) -> bool {
        self.status == OperationStatus::Pending
    }
}

// =========================================================================
// ERROR LOG / USER-FACING
// =========================================================================

/// A handled error with context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(error: &HavenError, context: BTreeMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: error.kind(),
            message: error.to_string(),
            context,
            timestamp: now,
        }
    }
}

/// "This feature is degraded, here is what still works."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degraded {
    pub feature: String,
    pub message: String,
    pub still_available: Vec<String>,
    /// Only set when the durable store itself has failed
    pub data_at_risk: bool,
}

impl Degraded {
    /// Build the user-facing payload for an error without exposing it raw.
    pub fn from_error(feature: impl Into<String>, error: &HavenError) -> Self {
        let feature = feature.into();
        let (message, still_available) = match error.root() {
            HavenError::Storage { fatal: true, .. } => (
                "Changes could not be saved on this device. Your data may not be safe; \
                 keep the app open and reconnect to sync."
                    .to_string(),
                vec!["viewing data already on screen".to_string()],
            ),
            HavenError::Validation { guidance, .. } => (
                format!("This request could not be completed. {guidance}"),
                vec!["everything else in the app".to_string()],
            ),
            HavenError::ServiceUnavailable { .. } | HavenError::RateLimited { .. } => (
                format!("{feature} is temporarily unavailable while the service recovers."),
                vec![
                    "previously loaded data".to_string(),
                    "logging new entries offline".to_string(),
                ],
            ),
            _ => (
                format!("{feature} needs a connection. It will refresh when you are back online."),
                vec![
                    "previously loaded data".to_string(),
                    "logging new entries offline".to_string(),
                ],
            ),
        };
        Self {
            data_at_risk: error.is_data_at_risk(),
            feature,
            message,
            still_available,
        }
    }
}

/// Convenience for tests and adapters: base64 of a body as stored.
pub fn encode_body(body: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::to_delta;

    fn record(threshold: u32, successes: u32) -> ServiceHealthRecord {
        ServiceHealthRecord::new(
            "insight-service",
            &CircuitBreakerConfig {
                failure_threshold: threshold,
                half_open_success_threshold: successes,
                open_timeout: Duration::from_millis(30_000),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Utc::now();
        let mut r = record(3, 1);
        assert_eq!(r.record_failure(now, false), None);
        assert_eq!(r.record_failure(now, false), None);
        assert_eq!(r.record_failure(now, false), Some(Transition::Opened { failures: 3 }));
        assert_eq!(r.state, CircuitState::Open);
        assert!(matches!(r.admit(now).0, Admission::Rejected { .. }));
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let now = Utc::now();
        let mut r = record(3, 1);
        r.record_failure(now, false);
        r.record_failure(now, false);
        r.record_success(false);
        assert_eq!(r.failure_count, 0);
        r.record_failure(now, false);
        assert_eq!(r.state, CircuitState::Closed);
    }

    #[test]
    fn test_timeout_elapsed_admits_single_probe() {
        let t0 = Utc::now();
        let mut r = record(1, 2);
        r.record_failure(t0, false);

        let before = t0 + to_delta(Duration::from_millis(29_999));
        assert!(matches!(r.admit(before).0, Admission::Rejected { .. }));

        let after = t0 + to_delta(Duration::from_millis(30_000));
        assert_eq!(r.admit(after), (Admission::Probe, Some(Transition::HalfOpened)));
        assert_eq!(r.state, CircuitState::HalfOpen);
        // second caller while the probe is running fails fast
        assert!(matches!(r.admit(after).0, Admission::Rejected { .. }));

        assert_eq!(r.record_success(true), None);
        assert_eq!(r.admit(after).0, Admission::Probe);
        assert_eq!(r.record_success(true), Some(Transition::Closed));
        assert_eq!(r.state, CircuitState::Closed);
        assert_eq!(r.failure_count, 0);
        assert_eq!(r.success_count_in_half_open, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let t0 = Utc::now();
        let mut r = record(1, 3);
        r.record_failure(t0, false);
        let t1 = t0 + to_delta(Duration::from_secs(31));
        r.admit(t1);
        r.record_success(true);
        r.admit(t1);
        assert!(matches!(r.record_failure(t1, true), Some(Transition::Opened { .. })));
        assert_eq!(r.state, CircuitState::Open);
        assert_eq!(r.success_count_in_half_open, 0);
        assert_eq!(r.last_failure_at, Some(t1));
    }

    #[test]
    fn test_late_outcomes_do_not_settle_the_probe() {
        let t0 = Utc::now();
        let mut r = record(1, 1);
        r.record_failure(t0, false);
        let t1 = t0 + to_delta(Duration::from_secs(31));
        assert_eq!(r.admit(t1).0, Admission::Probe);

        // a call admitted while closed finishes during the probe
        assert_eq!(r.record_success(false), None);
        assert_eq!(r.state, CircuitState::HalfOpen);
        assert_eq!(r.success_count_in_half_open, 0);
        assert!(matches!(r.admit(t1).0, Admission::Rejected { .. }));

        assert_eq!(r.record_failure(t1, false), None);
        assert_eq!(r.state, CircuitState::HalfOpen);
        assert!(r.probe_in_flight);

        assert_eq!(r.record_success(true), Some(Transition::Closed));
    }

    #[test]
    fn test_entry_expiry_is_strict() {
        let t0 = Utc::now();
        let entry = CacheEntry {
            key: "https://app.example/api/insights".to_string(),
            body: b"{}".to_vec(),
            content_type: Some("application/json".to_string()),
            cached_at: t0,
            ttl: Duration::from_millis(86_400_000),
            region: CacheRegion::Dynamic,
            category: CacheCategory::ApiJson,
            strategy: CacheStrategy::NetworkFirst,
        };
        assert!(!entry.is_expired(t0 + to_delta(Duration::from_millis(86_400_000))));
        assert!(entry.is_expired(t0 + to_delta(Duration::from_millis(90_000_000))));
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let entry = CacheEntry {
            key: "k".to_string(),
            body: vec![0, 159, 146, 150],
            content_type: None,
            cached_at: Utc::now(),
            ttl: Duration::from_secs(1),
            region: CacheRegion::Image,
            category: CacheCategory::Image,
            strategy: CacheStrategy::CacheFirst,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], encode_body(&[0, 159, 146, 150]));
        assert_eq!(json["category"], "image");
        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, entry.body);
    }

    #[test]
    fn test_draft_validation() {
        let ok = OperationDraft::new(
            OperationKind::Update,
            "sleep-logs",
            "r1",
            serde_json::json!({"hours": 7}),
        );
        assert!(ok.validate().is_ok());

        let no_payload = OperationDraft::new(OperationKind::Create, "sleep-logs", "r1", serde_json::Value::Null);
        assert!(matches!(no_payload.validate(), Err(HavenError::Validation { .. })));

        let delete = OperationDraft::new(OperationKind::Delete, "sleep-logs", "r1", serde_json::Value::Null);
        assert!(delete.validate().is_ok());

        let empty = OperationDraft::new(OperationKind::Delete, "", "r1", serde_json::Value::Null);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(OperationStatus::InFlight).unwrap(),
            serde_json::json!("in-flight")
        );
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("HALF_OPEN")
        );
    }

    #[test]
    fn test_degraded_never_exposes_raw_error() {
        let err = HavenError::network("tcp connect error: os error 111");
        let degraded = Degraded::from_error("Sleep insights", &err);
        assert!(!degraded.message.contains("os error"));
        assert!(!degraded.data_at_risk);

        let fatal = HavenError::storage("offlineQueue", "quota exceeded").into_fatal();
        assert!(Degraded::from_error("Sync", &fatal).data_at_risk);
    }
}
