//! Loading configuration from YAML/JSON.

use std::fs;
use std::path::Path;
use thiserror::Error;

use super::{schema::validate_config_schema, HavenConfig};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl HavenConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let json = serde_json::to_value(value)?;
        Self::from_value(json)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Load configuration from a file; `.json` is JSON, anything else YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document parses as null
        let value = if value.is_null() {
            serde_json::json!({})
        } else {
            value
        };
        validate_config_schema(&value).map_err(ConfigError::SchemaError)?;
        let config: HavenConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.half_open_success_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        for (service, o) in &cb.services {
            if o.failure_threshold == Some(0) || o.half_open_success_threshold == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "circuit breaker thresholds for '{service}' must be at least 1"
                )));
            }
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "retry.backoff_factor must be >= 1.0, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry.base_delay must not exceed retry.max_delay".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.error_log.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "error_log.max_size must be at least 1".to_string(),
            ));
        }
        if self.limiter.max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "limiter.max_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheCategory;
    use std::time::Duration;

    #[test]
    fn test_parse_minimal_yaml() {
        let config = HavenConfig::from_yaml("circuit_breaker:\n  failure_threshold: 4\n").unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 4);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(HavenConfig::from_yaml("").unwrap(), HavenConfig::default());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
circuit_breaker:
  failure_threshold: 3
  open_timeout_ms: 30000
  half_open_success_threshold: 1
  services:
    insight-service:
      open_timeout: "1m"
retry:
  max_retries: 2
  base_delay: 250
  backoff_factor: 1.5
  jitter: false
cache:
  ttl_by_category:
    api/json: 86400000
    image: "7days"
  image_size_limit: 65536
queue:
  max_queue_attempts: 4
error_log:
  max_log_size: 50
"#;
        let config = HavenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_millis(30_000));
        assert_eq!(
            config.circuit_breaker.for_service("insight-service").open_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert!(!config.retry.jitter);
        assert_eq!(
            config.cache.ttl_for(CacheCategory::ApiJson),
            Duration::from_millis(86_400_000)
        );
        assert_eq!(
            config.cache.ttl_for(CacheCategory::Image),
            Duration::from_secs(7 * 24 * 60 * 60)
        );
        assert_eq!(config.queue.max_attempts, 4);
        assert_eq!(config.error_log.max_size, 50);
    }

    #[test]
    fn test_json_round_trip_through_loader() {
        let json = serde_json::to_string(&HavenConfig::default()).unwrap();
        assert_eq!(HavenConfig::from_json(&json).unwrap(), HavenConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected_by_schema() {
        let result = HavenConfig::from_yaml("retry:\n  attempts: 3\n");
        assert!(matches!(result, Err(ConfigError::SchemaError(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = HavenConfig::from_yaml("circuit_breaker:\n  failure_threshold: 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_factor_below_one_rejected() {
        let result = HavenConfig::from_yaml("retry:\n  backoff_factor: 0.5\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
