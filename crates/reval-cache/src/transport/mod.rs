//! Transport collaborator.
//!
//! The orchestrator talks to the network only through [`Transport`]. A
//! transport returns whatever status the remote produced; deciding what a
//! status means for the cache happens in the orchestrator. Transports only
//! return `Err` when no response was obtained (connect failure, timeout).

mod helpers;
pub mod http;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ETAG};
use reqwest::Method;

use crate::error::CacheResult;

pub use helpers::parse_max_age;
pub use http::HttpTransport;

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// The `If-None-Match` validator on this request, if any.
    pub fn if_none_match(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
    }
}

/// A response as received from the remote.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|v| v.to_str().ok())
    }

    /// TTL override from `Cache-Control: max-age`.
    pub fn max_age(&self) -> Option<u64> {
        parse_max_age(&self.headers)
    }
}

/// Sends requests on behalf of the orchestrator.
#[async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync {
    async fn send(&self, request: TransportRequest) -> CacheResult<TransportResponse>;
}
