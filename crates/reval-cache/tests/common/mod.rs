//! Shared fakes for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reval_cache::{
    CacheConfig, CacheEntry, CacheError, CacheResult, CacheState, ChangeFeed, EntryStore,
    HeaderMap, ManualClock, ReactiveCache, SqliteStore, Transport, TransportRequest,
    TransportResponse,
};
use tokio::sync::watch;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fixed starting instant with whole milliseconds.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn ok(body: &str, etag: Option<&str>) -> CacheResult<TransportResponse> {
    let mut response = TransportResponse::new(200);
    response.body = body.as_bytes().to_vec();
    if let Some(etag) = etag {
        response.headers.insert("etag", etag.parse().unwrap());
    }
    Ok(response)
}

pub fn ok_with_max_age(body: &str, max_age: u64) -> CacheResult<TransportResponse> {
    let mut response = TransportResponse::new(200);
    response.body = body.as_bytes().to_vec();
    response.headers.insert(
        "cache-control",
        format!("max-age={}", max_age).parse().unwrap(),
    );
    Ok(response)
}

pub fn not_modified() -> CacheResult<TransportResponse> {
    Ok(TransportResponse::new(304))
}

pub fn status(code: u16) -> CacheResult<TransportResponse> {
    Ok(TransportResponse {
        status: code,
        headers: HeaderMap::new(),
        body: Vec::new(),
    })
}

pub fn network_error() -> CacheResult<TransportResponse> {
    Err(CacheError::Transport {
        message: "connection refused".to_string(),
        status: None,
    })
}

/// Transport replaying queued responses in order and recording requests.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<CacheResult<TransportResponse>>>,
    requests: Mutex<Vec<TransportRequest>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: CacheResult<TransportResponse>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> CacheResult<TransportResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(CacheError::Transport {
                message: "no scripted response".to_string(),
                status: None,
            })
        })
    }
}

/// SQLite store whose writes can be made to fail.
#[derive(Debug)]
pub struct FailingStore {
    inner: SqliteStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::memory().unwrap(),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Store {
                message: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntryStore for FailingStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.inner.get(key).await
    }

    async fn upsert(&self, entry: &CacheEntry) -> CacheResult<()> {
        self.check()?;
        self.inner.upsert(entry).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn clear(&self) -> CacheResult<Vec<String>> {
        self.check()?;
        self.inner.clear().await
    }

    fn subscribe(&self) -> ChangeFeed {
        self.inner.subscribe()
    }
}

/// In-memory cache driven by `transport` and a manual clock at [`t0`].
pub fn cache_with(config: CacheConfig, transport: Arc<ScriptedTransport>) -> (ReactiveCache, ManualClock) {
    init_tracing();
    let clock = ManualClock::new(t0());
    let cache = ReactiveCache::init_with_clock(config, transport, Arc::new(clock.clone()))
        .expect("failed to init cache");
    (cache, clock)
}

pub fn cache(transport: Arc<ScriptedTransport>) -> (ReactiveCache, ManualClock) {
    cache_with(CacheConfig::in_memory(), transport)
}

/// Wait until the state stream satisfies `pred`.
pub async fn wait_for<T: Clone>(
    rx: &mut watch::Receiver<CacheState<T>>,
    pred: impl FnMut(&CacheState<T>) -> bool,
) -> CacheState<T> {
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("state stream closed");
    (*state).clone()
}
