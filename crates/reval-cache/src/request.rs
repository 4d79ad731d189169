//! Per-request configuration: what to fetch and how to cache it.

use std::fmt;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CacheError, CacheResult};
use crate::key::{derive_key, KeyFn};
use crate::transport::{TransportRequest, TransportResponse};

/// Caller-supplied extraction of the cacheable body from a response.
pub type Extractor = Arc<dyn Fn(&TransportResponse) -> CacheResult<Vec<u8>> + Send + Sync>;

/// One logical request.
#[derive(Clone)]
pub struct RequestSpec {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub headers: HeaderMap,
    /// TTL for this request when the response does not override it.
    pub default_ttl: Option<u64>,
    key_fn: Option<KeyFn>,
    extractor: Option<Extractor>,
}

impl fmt::Debug for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSpec")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("default_ttl", &self.default_ttl)
            .field("custom_key", &self.key_fn.is_some())
            .field("custom_extractor", &self.extractor.is_some())
            .finish()
    }
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            headers: HeaderMap::new(),
            default_ttl: None,
            key_fn: None,
            extractor: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json_body<B: Serialize + ?Sized>(self, body: &B) -> CacheResult<Self> {
        let value = serde_json::to_value(body).map_err(|e| CacheError::Encoding {
            message: format!("failed to serialize request body: {}", e),
        })?;
        Ok(self.with_body(value))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> CacheResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| CacheError::Encoding {
            message: format!("invalid header name {:?}: {}", name, e),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| CacheError::Encoding {
            message: format!("invalid value for header {}: {}", name, e),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl = Some(ttl_secs);
        self
    }

    /// Override key derivation, e.g. to collapse several URLs into one slot.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&Method, &str, Option<&Value>) -> CacheResult<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Override which bytes of a response are cached.
    pub fn with_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&TransportResponse) -> CacheResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// The cache key for this request.
    pub fn cache_key(&self) -> CacheResult<String> {
        match &self.key_fn {
            Some(key_fn) => key_fn(&self.method, &self.url, self.body.as_ref()),
            None => derive_key(&self.method, &self.url, self.body.as_ref()),
        }
    }

    /// Build the outgoing request, conditional on `etag` when given.
    pub fn to_transport(&self, etag: Option<&str>) -> CacheResult<TransportRequest> {
        let mut request = TransportRequest::new(self.method.clone(), self.url.clone());
        request.headers = self.headers.clone();

        if let Some(body) = &self.body {
            let bytes = serde_json::to_vec(body).map_err(|e| CacheError::Encoding {
                message: format!("failed to serialize request body: {}", e),
            })?;
            if !request.headers.contains_key(CONTENT_TYPE) {
                request
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            request.body = Some(bytes);
        }

        if let Some(etag) = etag {
            let value = HeaderValue::from_str(etag).map_err(|e| CacheError::Encoding {
                message: format!("stored etag is not a valid header value: {}", e),
            })?;
            request.headers.insert(IF_NONE_MATCH, value);
        }

        Ok(request)
    }

    /// The bytes of `response` to cache.
    pub fn extract(&self, response: &TransportResponse) -> CacheResult<Vec<u8>> {
        match &self.extractor {
            Some(extractor) => extractor(response),
            None => Ok(response.body.clone()),
        }
    }
}
