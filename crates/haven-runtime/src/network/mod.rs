//! Outbound network abstraction.
//!
//! The runtime never opens sockets itself. Hosts plug in a
//! [`NetworkClient`]; tests plug in a scripted fake.

use async_trait::async_trait;
use haven_core::HavenError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpNetworkClient;

/// HTTP method of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<JsonValue>,
}

impl NetworkRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_json(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response with any status. Transport failures are errors instead.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl NetworkResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    /// 200 with a JSON body.
    pub fn json(value: &JsonValue) -> Self {
        Self::new(
            200,
            Some("application/json".to_string()),
            value.to_string().into_bytes(),
        )
    }

    /// Empty body with the given status.
    pub fn status(status: u16) -> Self {
        Self::new(status, None, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map a non-success status to the error taxonomy.
    ///
    /// 408 is a network timeout; 429 and 5xx mean the service is
    /// struggling; any other 4xx is the caller's fault and never retried.
    pub fn error_for_status(&self, service: &str) -> Option<HavenError> {
        match self.status {
            200..=399 => None,
            408 => Some(HavenError::network(format!("{service} responded 408 request timeout"))),
            429 => Some(HavenError::upstream_unavailable(service, "429 too many requests")),
            500..=599 => Some(HavenError::upstream_unavailable(
                service,
                format!("upstream responded {}", self.status),
            )),
            status => Some(HavenError::validation(
                format!("{service} rejected the request with {status}"),
                "check the request body and identifiers; repeating it unchanged will not help",
            )),
        }
    }

    /// `Ok(self)` for success statuses, otherwise the mapped error.
    pub fn into_success(self, service: &str) -> Result<Self, HavenError> {
        match self.error_for_status(service) {
            None => Ok(self),
            Some(err) => Err(err),
        }
    }
}

/// Transport to upstream services.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Client name for logs.
    fn name(&self) -> &str {
        "network"
    }

    /// Send a request. Transport failures (no route, reset, timeout) are
    /// `Network` errors; HTTP error statuses come back as responses.
    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse, HavenError>;

    /// Cheap reachability check used by capability detection.
    async fn is_reachable(&self) -> bool {
        true
    }
}
