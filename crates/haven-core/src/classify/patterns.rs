//! Path patterns used to classify outbound requests.
//!
//! Rules are checked in a fixed order by [`RequestClassifier`](super::RequestClassifier);
//! these patterns only answer "does this path look like X".

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Raster and vector image files
    pub static ref IMAGE_PATH: Regex = Regex::new(
        r"(?i)\.(png|jpe?g|gif|webp|avif|svg|ico|bmp)$"
    ).unwrap();

    /// Build artefacts and fonts that are versioned by deploy
    pub static ref STATIC_PATH: Regex = Regex::new(
        r"(?i)\.(m?js|css|woff2?|ttf|otf|eot|map|wasm)$"
    ).unwrap();

    /// JSON/REST endpoints
    pub static ref API_PATH: Regex = Regex::new(
        r"(?i)^/(api|v[0-9]+|graphql)(/|$)"
    ).unwrap();

    /// HTML documents and extension-less app routes
    pub static ref DOCUMENT_PATH: Regex = Regex::new(
        r"(?i)(\.html?$|/[^./]*$)"
    ).unwrap();
}

/// Check if a path names an image file.
pub fn is_image_path(path: &str) -> bool {
    IMAGE_PATH.is_match(path)
}

/// Check if a path names a static build asset.
pub fn is_static_path(path: &str) -> bool {
    STATIC_PATH.is_match(path)
}

/// Check if a path is under an API prefix.
pub fn is_api_path(path: &str) -> bool {
    API_PATH.is_match(path)
}

/// Check if a path looks like a page the user navigates to.
pub fn is_document_path(path: &str) -> bool {
    DOCUMENT_PATH.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_paths() {
        assert!(is_image_path("/img/avatar.PNG"));
        assert!(is_image_path("/charts/sleep.webp"));
        assert!(!is_image_path("/img/avatar.png.json"));
    }

    #[test]
    fn test_static_paths() {
        assert!(is_static_path("/assets/app.3f2a.js"));
        assert!(is_static_path("/fonts/inter.woff2"));
        assert!(!is_static_path("/api/styles"));
    }

    #[test]
    fn test_api_paths() {
        assert!(is_api_path("/api/insights"));
        assert!(is_api_path("/v2/steps"));
        assert!(is_api_path("/graphql"));
        assert!(!is_api_path("/apiary.html"));
    }

    #[test]
    fn test_document_paths() {
        assert!(is_document_path("/dashboard"));
        assert!(is_document_path("/reports/weekly.html"));
        assert!(!is_document_path("/data/export.csv"));
    }
}
