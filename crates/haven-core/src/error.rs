//! Error taxonomy shared by every Haven component.
//!
//! Errors carry enough classification for the runtime to decide whether
//! to retry, whether the failure counts against a dependency's circuit,
//! and what to tell the user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`HavenError`].
pub type Result<T> = std::result::Result<T, HavenError>;

/// Errors produced by the resilience and offline-continuity layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HavenError {
    /// Transient connectivity loss, including timeouts.
    #[error("network error: {message}")]
    Network { message: String },

    /// The dependency is failing upstream, or its circuit is open.
    #[error("service '{service}' unavailable: {reason}")]
    ServiceUnavailable {
        service: String,
        reason: String,
        /// True when the local circuit rejected the call without trying it.
        circuit_open: bool,
    },

    /// Durable store read/write failure.
    #[error("storage error in {region}: {message}")]
    Storage {
        region: String,
        message: String,
        /// True once the alternate persistence path has also failed.
        fatal: bool,
    },

    /// Caller-supplied bad input. Never retried.
    #[error("invalid input: {message}. {guidance}")]
    Validation { message: String, guidance: String },

    /// Replay rejected because the remote record changed underneath it.
    #[error("sync conflict on {collection}/{record_id}: {message}")]
    SyncConflict {
        collection: String,
        record_id: String,
        message: String,
    },

    /// The per-action attempt budget is spent for the current window.
    #[error("attempt budget exhausted for '{action}', resets in {resets_in:?}")]
    RateLimited { action: String, resets_in: Duration },

    /// Wraps the last error once a retry loop gives up.
    #[error("{source} (after {attempts} attempts)")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<HavenError>,
    },
}

/// Stable taxonomy name of an error, recorded in the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NetworkError,
    ServiceUnavailableError,
    StorageError,
    ValidationError,
    SyncConflictError,
    RateLimitedError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::ServiceUnavailableError => "ServiceUnavailableError",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::SyncConflictError => "SyncConflictError",
            ErrorKind::RateLimitedError => "RateLimitedError",
        };
        f.write_str(name)
    }
}

impl HavenError {
    /// Network failure with a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// A call that did not settle within `after`.
    pub fn timeout(after: Duration) -> Self {
        Self::Network {
            message: format!("timed out after {after:?}"),
        }
    }

    /// Upstream reported itself unavailable (5xx, throttling).
    pub fn upstream_unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
            circuit_open: false,
        }
    }

    /// The local circuit rejected the call.
    pub fn circuit_open(service: impl Into<String>, retry_after: Duration) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: format!("circuit open, next probe in {retry_after:?}"),
            circuit_open: true,
        }
    }

    /// Recoverable storage failure in `region`.
    pub fn storage(region: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            region: region.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// Bad caller input plus what to do about it.
    pub fn validation(message: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            guidance: guidance.into(),
        }
    }

    /// Strip any retry annotation.
    pub fn root(&self) -> &HavenError {
        match self {
            HavenError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Taxonomy name of the root error.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            HavenError::Network { .. } => ErrorKind::NetworkError,
            HavenError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailableError,
            HavenError::Storage { .. } => ErrorKind::StorageError,
            HavenError::Validation { .. } => ErrorKind::ValidationError,
            HavenError::SyncConflict { .. } => ErrorKind::SyncConflictError,
            HavenError::RateLimited { .. } => ErrorKind::RateLimitedError,
            HavenError::RetryExhausted { .. } => unreachable!("root() never returns RetryExhausted"),
        }
    }

    /// Total attempts made before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            HavenError::RetryExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Circuit-open rejections are not retryable in place: the breaker
    /// already decided not to try.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            HavenError::Network { .. } => true,
            HavenError::ServiceUnavailable { circuit_open, .. } => !circuit_open,
            _ => false,
        }
    }

    /// Whether this outcome counts as a failure of the dependency.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self.root(),
            HavenError::Network { .. }
                | HavenError::ServiceUnavailable {
                    circuit_open: false,
                    ..
                }
        )
    }

    /// Whether the local circuit rejected this call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self.root(),
            HavenError::ServiceUnavailable {
                circuit_open: true,
                ..
            }
        )
    }

    /// Terminal errors need caller intervention and are never replayed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.root(),
            HavenError::Validation { .. } | HavenError::SyncConflict { .. }
        )
    }

    /// Whether durable data may have been lost.
    pub fn is_data_at_risk(&self) -> bool {
        matches!(self.root(), HavenError::Storage { fatal: true, .. })
    }

    /// Mark a storage error as fatal; other errors pass through.
    pub fn into_fatal(self) -> Self {
        match self {
            HavenError::Storage {
                region, message, ..
            } => HavenError::Storage {
                region,
                message,
                fatal: true,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_annotation_preserves_kind() {
        let err = HavenError::RetryExhausted {
            attempts: 4,
            source: Box::new(HavenError::network("connection reset")),
        };
        assert_eq!(err.kind(), ErrorKind::NetworkError);
        assert_eq!(err.attempts(), 4);
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn test_validation_is_never_retryable() {
        let err = HavenError::validation("empty collection", "pass a collection name");
        assert!(!err.is_retryable());
        assert!(!err.trips_breaker());
        assert!(err.is_terminal());
    }

    #[test]
    fn test_circuit_open_does_not_trip_breaker() {
        let err = HavenError::circuit_open("insight-service", Duration::from_secs(5));
        assert!(err.is_circuit_open());
        assert!(!err.trips_breaker());
        assert!(!err.is_retryable());

        let upstream = HavenError::upstream_unavailable("insight-service", "503");
        assert!(upstream.trips_breaker());
        assert!(upstream.is_retryable());
    }

    #[test]
    fn test_fatal_storage_is_data_at_risk() {
        let err = HavenError::storage("offlineQueue", "disk full");
        assert!(!err.is_data_at_risk());
        assert!(err.into_fatal().is_data_at_risk());
    }
}
