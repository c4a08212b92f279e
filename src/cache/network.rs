//! Network seam used for manifest population and cache-miss fallback.

use std::fmt;

use async_trait::async_trait;
use axum::http::Method;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use super::keys::RequestKey;
use super::store::ResponseSnapshot;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request `{request}` failed: {detail}")]
    Transport { request: String, detail: String },
    #[error("request `{request}` timed out")]
    Timeout { request: String },
}

impl NetworkError {
    pub fn transport(request: &impl fmt::Display, detail: impl Into<String>) -> Self {
        Self::Transport {
            request: request.to_string(),
            detail: detail.into(),
        }
    }

    pub fn timeout(request: &impl fmt::Display) -> Self {
        Self::Timeout {
            request: request.to_string(),
        }
    }
}

/// A request as it goes out to the network: the cache identity plus the
/// end-to-end headers and body the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    key: RequestKey,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl FetchRequest {
    pub fn new(key: RequestKey) -> Self {
        Self {
            key,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn method(&self) -> &Method {
        self.key.method()
    }

    pub fn url(&self) -> &Url {
        self.key.url()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl From<RequestKey> for FetchRequest {
    fn from(key: RequestKey) -> Self {
        Self::new(key)
    }
}

impl From<&RequestKey> for FetchRequest {
    fn from(key: &RequestKey) -> Self {
        Self::new(key.clone())
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

/// Performs a live request. Any HTTP status is a successful fetch; only
/// transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, NetworkError>;
}
