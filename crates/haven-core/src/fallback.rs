//! Deterministic substitute content for failed live calls.
//!
//! Resolution order for `(content_type, context)`:
//! 1. exact content type + context
//! 2. content type default
//! 3. category default (the part of the content type before '/')
//! 4. the generic string
//!
//! Resolution never fails.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

use crate::config::ConfigError;

/// Message used when nothing more specific is known.
pub const GENERIC_FALLBACK: &str =
    "This feature is temporarily unavailable. Everything you log is saved on this device.";

/// Which rule produced a substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    Exact,
    ContentType,
    Category,
    Generic,
}

/// Substitute content returned in place of a live result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitute {
    pub content_type: String,
    pub context: Option<String>,
    pub body: JsonValue,
    pub source: FallbackSource,
}

impl Substitute {
    /// The body as display text; JSON bodies are rendered compactly.
    pub fn text(&self) -> String {
        match &self.body {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One exact-match row in a fallback table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub content_type: String,
    pub context: String,
    pub body: JsonValue,
}

/// Serializable fallback table, typically loaded from YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackTable {
    #[serde(default)]
    pub exact: Vec<FallbackRule>,

    /// Defaults keyed by full content type ("insight") or category ("api")
    #[serde(default)]
    pub defaults: BTreeMap<String, JsonValue>,

    #[serde(default)]
    pub generic: Option<String>,
}

/// Resolves substitutes by content type and context.
#[derive(Debug, Clone)]
pub struct FallbackResolver {
    exact: BTreeMap<(String, String), JsonValue>,
    defaults: BTreeMap<String, JsonValue>,
    generic: String,
}

impl FallbackResolver {
    /// A resolver with no rules; everything resolves to the generic string.
    pub fn empty() -> Self {
        Self {
            exact: BTreeMap::new(),
            defaults: BTreeMap::new(),
            generic: GENERIC_FALLBACK.to_string(),
        }
    }

    /// Add an exact `(content_type, context)` rule.
    pub fn with_exact(
        mut self,
        content_type: impl Into<String>,
        context: impl Into<String>,
        body: JsonValue,
    ) -> Self {
        self.exact
            .insert((content_type.into(), context.into()), body);
        self
    }

    /// Add a default for a content type or category.
    pub fn with_default(mut self, key: impl Into<String>, body: JsonValue) -> Self {
        self.defaults.insert(key.into(), body);
        self
    }

    pub fn with_generic(mut self, generic: impl Into<String>) -> Self {
        self.generic = generic.into();
        self
    }

    /// Merge a table over the current rules; table rows win.
    pub fn with_table(mut self, table: FallbackTable) -> Self {
        for rule in table.exact {
            self.exact
                .insert((rule.content_type, rule.context), rule.body);
        }
        self.defaults.extend(table.defaults);
        if let Some(generic) = table.generic {
            self.generic = generic;
        }
        self
    }

    /// Built-in rules merged with a YAML table.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let table: FallbackTable = serde_yaml::from_str(yaml)?;
        Ok(Self::default().with_table(table))
    }

    /// Resolve a substitute. Never fails.
    pub fn resolve(&self, content_type: &str, context: Option<&str>) -> Substitute {
        let substitute = |body: &JsonValue, source| Substitute {
            content_type: content_type.to_string(),
            context: context.map(str::to_string),
            body: body.clone(),
            source,
        };

        if let Some(ctx) = context {
            if let Some(body) = self
                .exact
                .get(&(content_type.to_string(), ctx.to_string()))
            {
                return substitute(body, FallbackSource::Exact);
            }
        }
        if let Some(body) = self.defaults.get(content_type) {
            return substitute(body, FallbackSource::ContentType);
        }
        let category = content_type.split('/').next().unwrap_or(content_type);
        if category != content_type {
            if let Some(body) = self.defaults.get(category) {
                return substitute(body, FallbackSource::Category);
            }
        }
        tracing::debug!(content_type, ?context, "No fallback rule, using generic substitute");
        substitute(&JsonValue::String(self.generic.clone()), FallbackSource::Generic)
    }
}

impl Default for FallbackResolver {
    /// Built-in substitutes for the health-tracking surfaces.
    fn default() -> Self {
        Self::empty()
            .with_exact(
                "insight",
                "sleep",
                json!("Your recent sleep entries are saved on this device. New sleep insights will appear once you're back online."),
            )
            .with_exact(
                "insight",
                "activity",
                json!("Keep logging activity as usual. Trends will update when the connection returns."),
            )
            .with_exact(
                "insight",
                "nutrition",
                json!("Meals you log now are stored locally. Nutrition insights will refresh after syncing."),
            )
            .with_exact(
                "recommendation",
                "hydration",
                json!("A steady glass of water every couple of hours is a good default while personalised tips are unavailable."),
            )
            .with_default(
                "insight",
                json!("Insights are unavailable right now. Your data is safe and will be analysed when the service is reachable."),
            )
            .with_default(
                "recommendation",
                json!("Personalised recommendations are paused. Continue with your current plan."),
            )
            .with_default(
                "summary",
                json!("A summary can't be generated right now. Your entries are listed below."),
            )
            .with_default("api/json", json!({ "items": [], "degraded": true }))
            .with_default("api", json!({ "degraded": true }))
            .with_default("image", json!(""))
            .with_default(
                "document",
                json!("You're offline. Pages you've visited before are still available."),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_first() {
        let resolver = FallbackResolver::default();
        let s = resolver.resolve("insight", Some("sleep"));
        assert_eq!(s.source, FallbackSource::Exact);
        assert!(s.text().contains("sleep"));
    }

    #[test]
    fn test_content_type_default_when_context_unknown() {
        let resolver = FallbackResolver::default();
        let s = resolver.resolve("insight", Some("heart-rate"));
        assert_eq!(s.source, FallbackSource::ContentType);
    }

    #[test]
    fn test_category_default() {
        let resolver = FallbackResolver::default();
        let s = resolver.resolve("api/xml", None);
        assert_eq!(s.source, FallbackSource::Category);
        assert_eq!(s.body, json!({ "degraded": true }));
    }

    #[test]
    fn test_generic_last() {
        let resolver = FallbackResolver::default();
        let s = resolver.resolve("weather", Some("today"));
        assert_eq!(s.source, FallbackSource::Generic);
        assert_eq!(s.text(), GENERIC_FALLBACK);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = FallbackResolver::default();
        assert_eq!(
            resolver.resolve("api/json", Some("/api/steps")),
            resolver.resolve("api/json", Some("/api/steps"))
        );
    }

    #[test]
    fn test_yaml_table_overrides() {
        let yaml = r#"
exact:
  - content_type: insight
    context: sleep
    body: "Custom sleep message"
defaults:
  report: "Reports are generated once you're online."
generic: "Unavailable."
"#;
        let resolver = FallbackResolver::from_yaml(yaml).unwrap();
        assert_eq!(resolver.resolve("insight", Some("sleep")).text(), "Custom sleep message");
        assert_eq!(resolver.resolve("report", None).source, FallbackSource::ContentType);
        assert_eq!(resolver.resolve("unknown", None).text(), "Unavailable.");
        // built-ins survive the merge
        assert_eq!(resolver.resolve("insight", Some("activity")).source, FallbackSource::Exact);
    }
}
