//! Request classification and cache-key normalization.
//!
//! Classification is an explicit, ordered rule set so the same request
//! always lands in the same class:
//!
//! 1. Path on the critical allowlist -> `Critical`
//! 2. Image hint or image extension -> `Image`
//! 3. Data hint or API path prefix -> `Api`
//! 4. Script/style/font hint or static extension -> `Static`
//! 5. Navigate hint or document-looking path -> `Navigation`
//! 6. Everything else -> `Other`

pub mod patterns;

use std::collections::BTreeSet;
use url::Url;

use crate::error::HavenError;
use crate::types::{CacheRequest, ResourceClass, ResourceHint};

/// Origin used to resolve relative request URLs.
const LOCAL_ORIGIN: &str = "http://localhost/";

/// A request after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// Normalized request identity, used as the cache key
    pub key: String,
    /// Absolute URL to fetch
    pub url: String,
    /// Host the request goes to; names the circuit guarding it
    pub host: String,
    pub path: String,
    pub class: ResourceClass,
}

/// Assigns resource classes to outbound requests.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    critical_paths: BTreeSet<String>,
}

impl RequestClassifier {
    pub fn new<I, S>(critical_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            critical_paths: critical_paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Classify a request.
    ///
    /// Fails with `Validation` only when the URL cannot be parsed.
    pub fn classify(&self, request: &CacheRequest) -> Result<Classified, HavenError> {
        let url = parse(&request.url)?;
        let path = url.path().to_string();
        let class = self.class_for(&path, request.resource_hint);
        Ok(Classified {
            key: normalize(url.clone()),
            url: url.to_string(),
            host: url.host_str().unwrap_or("localhost").to_string(),
            path,
            class,
        })
    }

    fn class_for(&self, path: &str, hint: ResourceHint) -> ResourceClass {
        if self.critical_paths.contains(path) {
            return ResourceClass::Critical;
        }
        if hint == ResourceHint::Image || patterns::is_image_path(path) {
            return ResourceClass::Image;
        }
        if hint == ResourceHint::Data || patterns::is_api_path(path) {
            return ResourceClass::Api;
        }
        if matches!(
            hint,
            ResourceHint::Script | ResourceHint::Style | ResourceHint::Font
        ) || patterns::is_static_path(path)
        {
            return ResourceClass::Static;
        }
        if hint == ResourceHint::Navigate || patterns::is_document_path(path) {
            return ResourceClass::Navigation;
        }
        ResourceClass::Other
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new(crate::config::CacheConfig::default().critical_paths)
    }
}

fn parse(raw: &str) -> Result<Url, HavenError> {
    let invalid = |e: url::ParseError| {
        HavenError::validation(
            format!("'{raw}' is not a valid request URL: {e}"),
            "pass an absolute URL or a path starting with '/'",
        )
    };
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(LOCAL_ORIGIN).map_err(invalid)?;
            base.join(raw).map_err(invalid)
        }
        Err(e) => Err(invalid(e)),
    }
}

/// Normalize a request URL into a cache key.
///
/// Drops the fragment and sorts query parameters so equivalent requests
/// share one entry. Scheme and host are already lowercased by the parser.
pub fn normalize_url(raw: &str) -> Result<String, HavenError> {
    parse(raw).map(normalize)
}

fn normalize(mut url: Url) -> String {
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn classify(url: &str, hint: ResourceHint) -> ResourceClass {
        RequestClassifier::default()
            .classify(&CacheRequest::new(url, hint))
            .unwrap()
            .class
    }

    #[test]
    fn test_critical_allowlist_wins() {
        assert_eq!(classify("/", ResourceHint::Navigate), ResourceClass::Critical);
        assert_eq!(
            classify("https://app.example/manifest.json", ResourceHint::Other),
            ResourceClass::Critical
        );
    }

    #[test]
    fn test_rule_order() {
        assert_eq!(classify("/img/chart.png", ResourceHint::Other), ResourceClass::Image);
        assert_eq!(classify("/api/insights", ResourceHint::Other), ResourceClass::Api);
        assert_eq!(classify("/export", ResourceHint::Data), ResourceClass::Api);
        assert_eq!(classify("/assets/app.js", ResourceHint::Other), ResourceClass::Static);
        assert_eq!(classify("/dashboard", ResourceHint::Other), ResourceClass::Navigation);
        assert_eq!(classify("/data/export.csv", ResourceHint::Other), ResourceClass::Other);
    }

    #[test]
    fn test_normalization_sorts_query_and_drops_fragment() {
        let a = normalize_url("https://App.Example/api/steps?to=2&from=1#today").unwrap();
        let b = normalize_url("https://app.example/api/steps?from=1&to=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, "https://app.example/api/steps?from=1&to=2");
    }

    #[test]
    fn test_relative_urls_resolve_locally() {
        let key = normalize_url("/api/steps").unwrap();
        assert_eq!(key, "http://localhost/api/steps");
    }

    #[test]
    fn test_invalid_url_is_validation_error() {
        let result = RequestClassifier::default()
            .classify(&CacheRequest::new("http://[::1", ResourceHint::Other));
        assert!(matches!(result, Err(HavenError::Validation { .. })));
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(segment in "[a-z]{1,8}", ext in "(png|js|json|html|)") {
            let path = if ext.is_empty() { format!("/{segment}") } else { format!("/{segment}.{ext}") };
            let first = classify(&path, ResourceHint::Other);
            let second = classify(&path, ResourceHint::Other);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_query_order_does_not_change_key(a in "[a-z]{1,5}", b in "[a-z]{1,5}") {
            prop_assume!(a != b);
            let one = normalize_url(&format!("/api/x?{a}=1&{b}=2")).unwrap();
            let two = normalize_url(&format!("/api/x?{b}=2&{a}=1")).unwrap();
            prop_assert_eq!(one, two);
        }
    }
}
