//! JSON Schema validation for configuration files.
//!
//! Files are validated against schema/config.schema.json before they are
//! deserialized, so typos in section or field names are reported with
//! their location instead of being silently defaulted.

use std::sync::OnceLock;

/// Embedded config schema (loaded at compile time).
const CONFIG_SCHEMA_JSON: &str = include_str!("../../schema/config.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(CONFIG_SCHEMA_JSON) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    result.as_ref().map_err(|e| e.clone())
}

/// Validate a configuration value against the schema.
///
/// Returns every violation as "message at /instance/path".
pub fn validate_config_schema(config_json: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(config_json)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_passes() {
        assert!(validate_config_schema(&serde_json::json!({})).is_ok());
    }

    #[test]
    fn test_duration_accepts_int_and_humantime() {
        let value = serde_json::json!({
            "circuit_breaker": { "open_timeout": 30000 },
            "timeouts": { "network": "10s", "storage": "5s" }
        });
        assert!(validate_config_schema(&value).is_ok());
    }

    #[test]
    fn test_unknown_category_fails() {
        let value = serde_json::json!({
            "cache": { "ttl_by_category": { "video": 1000 } }
        });
        assert!(validate_config_schema(&value).is_err());
    }

    #[test]
    fn test_critical_paths_must_be_absolute() {
        let value = serde_json::json!({
            "cache": { "critical_paths": ["index.html"] }
        });
        let errors = validate_config_schema(&value).unwrap_err();
        assert!(errors[0].contains("/cache/critical_paths/0"));
    }

    #[test]
    fn test_additional_properties_fail() {
        let value = serde_json::json!({ "telemetry": {} });
        assert!(validate_config_schema(&value).is_err());
    }
}
