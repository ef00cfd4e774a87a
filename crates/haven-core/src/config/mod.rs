//! Configuration for the resilience layer.
//!
//! Every section has working defaults; a config file only needs the
//! values it overrides. Files are checked against an embedded JSON Schema
//! before they are deserialized.

pub mod duration;
mod parser;
mod schema;

pub use parser::ConfigError;
pub use schema::validate_config_schema;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::CacheCategory;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HavenConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub error_log: ErrorLogConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Circuit breaker thresholds, shared by every dependency unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is allowed
    #[serde(with = "duration::millis", alias = "open_timeout_ms")]
    pub open_timeout: Duration,

    /// Probe successes needed to close
    pub half_open_success_threshold: u32,

    /// Per-dependency overrides keyed by service name
    pub services: BTreeMap<String, BreakerOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(30),
            half_open_success_threshold: 2,
            services: BTreeMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Effective settings for one dependency.
    pub fn for_service(&self, service: &str) -> CircuitBreakerConfig {
        let mut resolved = CircuitBreakerConfig {
            services: BTreeMap::new(),
            ..self.clone()
        };
        if let Some(o) = self.services.get(service) {
            if let Some(v) = o.failure_threshold {
                resolved.failure_threshold = v;
            }
            if let Some(v) = o.open_timeout {
                resolved.open_timeout = v;
            }
            if let Some(v) = o.half_open_success_threshold {
                resolved.half_open_success_threshold = v;
            }
        }
        resolved
    }
}

/// Partial breaker settings for a single dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    #[serde(with = "optional_millis", alias = "open_timeout_ms")]
    pub open_timeout: Option<Duration>,
    pub half_open_success_threshold: Option<u32>,
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Wrapped(#[serde(with = "super::duration::millis")] Duration);

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.map(Wrapped).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(d)?.map(|w| w.0))
    }
}

/// Backoff policy for the network leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,

    #[serde(with = "duration::millis", alias = "base_delay_ms")]
    pub base_delay: Duration,

    pub backoff_factor: f32,

    pub jitter: bool,

    /// Upper bound on any single delay
    #[serde(with = "duration::millis", alias = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter: true,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Cache strategy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum age per category before an entry is stale
    #[serde(with = "duration::millis_map")]
    pub ttl_by_category: BTreeMap<CacheCategory, Duration>,

    /// Images larger than this are served but never cached
    pub image_size_limit: u64,

    /// Paths always classified as critical
    pub critical_paths: Vec<String>,

    /// Entries kept in the in-memory layer
    pub memory_capacity: u64,

    #[serde(with = "duration::millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_by_category: BTreeMap::from([
                (CacheCategory::Static, 30 * DAY),
                (CacheCategory::ApiJson, DAY),
                (CacheCategory::Image, 7 * DAY),
                (CacheCategory::Other, DAY),
            ]),
            image_size_limit: 512 * 1024,
            critical_paths: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/offline.html".to_string(),
                "/manifest.json".to_string(),
            ],
            memory_capacity: 1_000,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl CacheConfig {
    /// TTL for a category; unknown categories fall back to `Other`, then one day.
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.ttl_by_category
            .get(&category)
            .or_else(|| self.ttl_by_category.get(&CacheCategory::Other))
            .copied()
            .unwrap_or(DAY)
    }
}

/// Offline queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Replay attempts before an operation is marked failed
    #[serde(alias = "max_queue_attempts")]
    pub max_attempts: u32,

    /// How long synced operations stay visible before removal
    #[serde(with = "duration::millis")]
    pub synced_grace: Duration,

    /// Periodic drain interval
    #[serde(with = "duration::millis")]
    pub drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            synced_grace: Duration::from_secs(5 * 60),
            drain_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorLogConfig {
    #[serde(alias = "max_log_size")]
    pub max_size: usize,

    /// How often new entries are written to the `errorLog` region
    #[serde(with = "duration::millis")]
    pub flush_interval: Duration,
}

impl Default for ErrorLogConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// Suspension-point timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(with = "duration::millis")]
    pub network: Duration,

    #[serde(with = "duration::millis")]
    pub storage: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            network: Duration::from_secs(10),
            storage: Duration::from_secs(5),
        }
    }
}

/// Per-action attempt budget. Disabled unless `max_attempts` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    pub max_attempts: Option<u32>,

    #[serde(with = "duration::millis")]
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            window: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HavenConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.timeouts.network, Duration::from_secs(10));
        assert_eq!(config.timeouts.storage, Duration::from_secs(5));
        assert_eq!(config.cache.ttl_for(CacheCategory::Image), 7 * DAY);
        assert_eq!(config.cache.ttl_for(CacheCategory::ApiJson), DAY);
    }

    #[test]
    fn test_service_override() {
        let mut config = CircuitBreakerConfig::default();
        config.services.insert(
            "insight-service".to_string(),
            BreakerOverride {
                failure_threshold: Some(5),
                ..Default::default()
            },
        );

        let resolved = config.for_service("insight-service");
        assert_eq!(resolved.failure_threshold, 5);
        assert_eq!(resolved.open_timeout, Duration::from_secs(30));
        assert_eq!(config.for_service("other").failure_threshold, 3);
    }

    #[test]
    fn test_missing_category_falls_back_to_other() {
        let mut config = CacheConfig::default();
        config.ttl_by_category.remove(&CacheCategory::Static);
        assert_eq!(config.ttl_for(CacheCategory::Static), DAY);
    }
}
