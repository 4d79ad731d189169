//! Fetch orchestration.
//!
//! For one request the orchestrator decides between serving the cached
//! entry, revalidating it with `If-None-Match`, or fetching it in full, and
//! then writes the result and announces it on the update bus.
//!
//! ```text
//! fetch(spec, force)
//!   key <- spec
//!   entry <- store
//!   force or no entry      -> full fetch
//!   entry fresh            -> cache hit (no write)
//!   entry stale            -> conditional fetch
//!       304                -> refresh timestamp/ttl, keep payload
//!       2xx                -> full fetch response
//!   write entry, publish Completed
//! ```
//!
//! Any failure leaves the stored entry as it was and publishes nothing;
//! the error is returned to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::bus::UpdateBus;
use crate::cipher::Cipher;
use crate::clock::{Clock, SystemClock};
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::request::RequestSpec;
use crate::staleness::{classify, Staleness};
use crate::store::EntryStore;
use crate::transport::{Transport, TransportResponse};

/// TTL used when nothing else supplies one.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Checks a freshly fetched body before it is stored.
pub type Validator<'a> = &'a (dyn Fn(&[u8]) -> CacheResult<()> + Send + Sync);

/// Which path a successful fetch took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The entry was fresh; no network call, no write.
    CacheHit,
    /// The remote confirmed the entry (304); timestamp refreshed.
    Revalidated,
    /// A full body was fetched and stored.
    Fetched,
}

/// The fetch/invalidate engine shared by every repository.
#[derive(Debug)]
pub struct Orchestrator {
    store: Arc<dyn EntryStore>,
    transport: Arc<dyn Transport>,
    cipher: Arc<Cipher>,
    bus: UpdateBus,
    clock: Arc<dyn Clock>,
    default_ttl_secs: u64,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EntryStore>,
        transport: Arc<dyn Transport>,
        cipher: Arc<Cipher>,
        bus: UpdateBus,
    ) -> Self {
        Self {
            store,
            transport,
            cipher,
            bus,
            clock: Arc::new(SystemClock),
            default_ttl_secs: DEFAULT_TTL_SECS,
            inflight: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn cipher(&self) -> &Arc<Cipher> {
        &self.cipher
    }

    pub fn bus(&self) -> &UpdateBus {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Refuse all further operations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_closed() {
            return Err(CacheError::NotInitialized {
                message: "cache has been shut down".to_string(),
            });
        }
        Ok(())
    }

    /// Fetch `spec`, honouring the cached entry unless `force_refresh`.
    pub async fn fetch(&self, spec: &RequestSpec, force_refresh: bool) -> CacheResult<FetchOutcome> {
        self.fetch_with(spec, force_refresh, &accept_any).await
    }

    /// Like [`fetch`](Self::fetch), but a full body is only stored if
    /// `validate` accepts it. A rejected body leaves the entry untouched and
    /// publishes nothing.
    pub async fn fetch_with(
        &self,
        spec: &RequestSpec,
        force_refresh: bool,
        validate: Validator<'_>,
    ) -> CacheResult<FetchOutcome> {
        self.ensure_open()?;
        let key = spec.cache_key()?;

        let _guard = self.lock_key(&key).await;
        match self.fetch_locked(&key, spec, force_refresh, validate).await {
            Ok(outcome) => {
                debug!(key = %key, ?outcome, force_refresh, "fetch completed");
                self.bus.completed(&key);
                Ok(outcome)
            }
            Err(e) => {
                warn!(key = %key, error = %e, kind = e.kind(), "fetch failed");
                Err(e)
            }
        }
    }

    async fn fetch_locked(
        &self,
        key: &str,
        spec: &RequestSpec,
        force_refresh: bool,
        validate: Validator<'_>,
    ) -> CacheResult<FetchOutcome> {
        let existing = self.store.get(key).await?;

        let validator = match (&existing, force_refresh) {
            (Some(entry), false) => match entry.staleness(self.clock.now()) {
                Staleness::Fresh => {
                    debug!(key, "cache hit");
                    return Ok(FetchOutcome::CacheHit);
                }
                Staleness::Stale => entry.etag.clone(),
            },
            _ => None,
        };

        let request = spec.to_transport(validator.as_deref())?;
        let response = self.transport.send(request).await?;

        if response.is_not_modified() {
            return match (existing, validator.is_some()) {
                (Some(entry), true) => self.revalidate(entry, &response).await,
                _ => Err(CacheError::Transport {
                    message: "received 304 Not Modified for an unconditional request".to_string(),
                    status: Some(304),
                }),
            };
        }

        if !response.is_success() {
            return Err(status_error(&response));
        }

        self.store_full(key, spec, existing.as_ref(), &response, validate)
            .await
    }

    async fn revalidate(
        &self,
        mut entry: CacheEntry,
        response: &TransportResponse,
    ) -> CacheResult<FetchOutcome> {
        let now = self.clock.now();
        entry.timestamp = entry.timestamp.max(now);
        if let Some(ttl) = response.max_age() {
            entry.ttl_secs = ttl;
        }
        if let Some(etag) = response.etag() {
            entry.etag = Some(etag.to_string());
        }
        entry.is_stale = classify(entry.timestamp, entry.ttl_secs, now).is_stale();

        self.store.upsert(&entry).await?;
        info!(key = %entry.key, ttl_secs = entry.ttl_secs, "entry revalidated");
        Ok(FetchOutcome::Revalidated)
    }

    async fn store_full(
        &self,
        key: &str,
        spec: &RequestSpec,
        existing: Option<&CacheEntry>,
        response: &TransportResponse,
        validate: Validator<'_>,
    ) -> CacheResult<FetchOutcome> {
        let body = spec.extract(response)?;
        validate(&body)?;
        let payload = self.cipher.seal(body)?;

        let now = self.clock.now();
        let timestamp = existing.map_or(now, |e| e.timestamp.max(now));
        let ttl_secs = response
            .max_age()
            .or(spec.default_ttl)
            .unwrap_or(self.default_ttl_secs);

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            etag: response.etag().map(String::from),
            timestamp,
            ttl_secs,
            is_stale: classify(timestamp, ttl_secs, now).is_stale(),
        };

        self.store.upsert(&entry).await?;
        info!(
            key,
            status = response.status,
            encrypted = entry.is_encrypted(),
            ttl_secs,
            "entry fetched"
        );
        Ok(FetchOutcome::Fetched)
    }

    /// Drop the entry for `spec`. Absent entries are not an error.
    pub async fn invalidate(&self, spec: &RequestSpec) -> CacheResult<bool> {
        let key = spec.cache_key()?;
        self.invalidate_key(&key).await
    }

    /// Drop the entry for `key` and publish `Invalidated`.
    pub async fn invalidate_key(&self, key: &str) -> CacheResult<bool> {
        self.ensure_open()?;
        let removed = self.store.delete(key).await?;
        debug!(key, removed, "invalidated");
        self.bus.invalidated(key);
        Ok(removed)
    }

    /// Drop every entry, publishing `Invalidated` for each removed key.
    pub async fn clear(&self) -> CacheResult<usize> {
        self.ensure_open()?;
        let removed = self.store.clear().await?;
        for key in &removed {
            self.bus.invalidated(key);
        }
        info!(count = removed.len(), "cache cleared");
        Ok(removed.len())
    }

    /// The stored entry for `key` with its staleness as of now.
    pub async fn peek(&self, key: &str) -> CacheResult<Option<(CacheEntry, Staleness)>> {
        self.ensure_open()?;
        let now = self.clock.now();
        Ok(self
            .store
            .get(key)
            .await?
            .map(|entry| {
                let staleness = entry.staleness(now);
                (entry, staleness)
            }))
    }

    /// Serialize fetches per key. The map only keeps locks someone holds or
    /// waits on.
    async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(inflight.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

fn accept_any(_: &[u8]) -> CacheResult<()> {
    Ok(())
}

fn status_error(response: &TransportResponse) -> CacheError {
    let snippet: String = String::from_utf8_lossy(&response.body)
        .chars()
        .take(200)
        .collect();
    let message = if snippet.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        format!("HTTP {}: {}", response.status, snippet)
    };
    CacheError::Transport {
        message,
        status: Some(response.status),
    }
}
