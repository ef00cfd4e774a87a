//! # haven-core
//!
//! Deterministic building blocks of the Haven offline-continuity layer.
//!
//! This crate holds everything that does not need I/O:
//! - the persisted data model (health records, cache entries, queued
//!   operations, error log entries)
//! - the circuit state machine, driven by an injected [`Clock`]
//! - request classification and cache-key normalization
//! - the fallback resolver
//! - configuration loading and schema validation
//!
//! The async runtime lives in `haven-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use haven_core::{CacheRequest, FallbackResolver, RequestClassifier, ResourceClass, ResourceHint};
//!
//! let classifier = RequestClassifier::default();
//! let classified = classifier
//!     .classify(&CacheRequest::new("/api/insights?day=mon", ResourceHint::Data))
//!     .unwrap();
//! assert_eq!(classified.class, ResourceClass::Api);
//!
//! let fallback = FallbackResolver::default().resolve("insight", Some("sleep"));
//! assert!(!fallback.text().is_empty());
//! ```

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod error_log;
pub mod fallback;
pub mod types;

// Re-export main types at crate root
pub use classify::{normalize_url, Classified, RequestClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BreakerOverride, CacheConfig, CircuitBreakerConfig, ConfigError, ErrorLogConfig,
    HavenConfig, LimiterConfig, QueueConfig, RetryConfig, TimeoutConfig,
};
pub use error::{ErrorKind, HavenError, Result};
pub use error_log::ErrorLog;
pub use fallback::{FallbackResolver, FallbackRule, FallbackSource, FallbackTable, Substitute};
pub use types::{
    Admission, CacheCategory, CacheEntry, CacheRegion, CacheRequest, CacheStrategy, CircuitState,
    Degraded, ErrorLogEntry, OperationDraft, OperationKind, OperationStatus, QueuedOperation,
    ResourceClass, ResourceHint, ServiceHealthRecord, Transition,
};
