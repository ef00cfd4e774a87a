//! `reqwest`-backed network client.
//!
//! The bearer token is held as a [`SecretString`] so it cannot end up in
//! `Debug` output or logs.

use async_trait::async_trait;
use haven_core::HavenError;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;

use super::{Method, NetworkClient, NetworkRequest, NetworkResponse};

/// Environment variable read by [`HttpNetworkClient::from_env`].
pub const HAVEN_API_TOKEN_ENV: &str = "HAVEN_API_TOKEN";

pub struct HttpNetworkClient {
    client: reqwest::Client,
    token: Option<SecretString>,
    health_url: Option<String>,
}

impl fmt::Debug for HttpNetworkClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpNetworkClient")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("health_url", &self.health_url)
            .finish()
    }
}

impl HttpNetworkClient {
    /// Client with a per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, HavenError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HavenError::network(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            token: None,
            health_url: None,
        })
    }

    /// Client authenticated with `HAVEN_API_TOKEN` when it is set.
    pub fn from_env(timeout: Duration) -> Result<Self, HavenError> {
        let client = Self::new(timeout)?;
        Ok(match std::env::var(HAVEN_API_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => client.with_bearer_token(SecretString::from(token)),
            _ => client,
        })
    }

    pub fn with_bearer_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// URL polled by [`NetworkClient::is_reachable`].
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> HavenError {
    if e.is_timeout() {
        HavenError::network(format!("request to {url} timed out"))
    } else {
        HavenError::network(format!("request to {url} failed: {e}"))
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: NetworkRequest) -> Result<NetworkResponse, HavenError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&request.url, e))?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&request.url, e))?;

        tracing::debug!(method = %request.method, url = %request.url, status, "HTTP request finished");
        Ok(NetworkResponse::new(status, content_type, body.to_vec()))
    }

    async fn is_reachable(&self) -> bool {
        let Some(url) = &self.health_url else {
            return true;
        };
        match self.client.get(url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }
}
