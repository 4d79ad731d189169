//! reqwest-backed transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use super::helpers::{backoff_delay, is_retryable_status, parse_retry_after};
use super::{Transport, TransportRequest, TransportResponse};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};

/// User agent for outgoing requests.
pub const USER_AGENT_VALUE: &str = concat!("reval-cache/", env!("CARGO_PKG_VERSION"));

/// HTTP transport over a shared reqwest client.
///
/// Retries network failures, 429 and 5xx up to `max_retries` times. With
/// the default of zero the first outcome is returned as is.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(timeout: Duration, max_retries: u32) -> CacheResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| CacheError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            max_retries,
        })
    }

    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        Self::new(Duration::from_secs(config.timeout_secs), config.max_retries)
    }

    async fn send_once(&self, request: &TransportRequest) -> CacheResult<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::Transport {
                message: format!("failed to read response body: {}", e),
                status: Some(status),
            })?
            .to_vec();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> CacheResult<TransportResponse> {
        debug!(
            method = %request.method,
            url = %request.url,
            conditional = request.if_none_match().is_some(),
            "sending request"
        );

        let mut retries = 0;
        loop {
            let outcome = self.send_once(&request).await;

            let retry_hint = match &outcome {
                Ok(response) if is_retryable_status(response.status) => {
                    Some(parse_retry_after(&response.headers))
                }
                Err(e) if e.is_retryable() => Some(None),
                _ => None,
            };

            match retry_hint {
                Some(hint) if retries < self.max_retries => {
                    retries += 1;
                    let backoff = backoff_delay(retries, hint);
                    warn!(
                        url = %request.url,
                        status = outcome.as_ref().ok().map(|r| r.status),
                        retry = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying request"
                    );
                    tokio::time::sleep(backoff).await;
                }
                _ => return outcome,
            }
        }
    }
}
