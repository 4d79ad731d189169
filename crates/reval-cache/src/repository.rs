//! Per-resource repository.
//!
//! A [`Resource`] binds one request and one decoder to the shared
//! orchestrator and republishes the cached entry as a typed
//! [`CacheState`]. State lives in a `watch` channel: a new subscriber sees
//! the latest snapshot immediately, and updates are field-wise merges so a
//! store change never wipes an in-flight `is_loading`.
//!
//! `is_loading` tracks this resource's own fetches only. Fetches completed
//! by other resources on the same key refresh the data but leave the flag
//! alone while one of ours is still running. Bodies the decoder rejects are
//! never stored.
//!
//! Two background listeners drive re-reads: the store's change feed
//! (filtered to this key) and the update bus (fetch/invalidate finished).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::bus::{BusMessage, UpdateKind, UpdateSubscription};
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::orchestrator::{FetchOutcome, Orchestrator};
use crate::request::RequestSpec;
use crate::staleness::Staleness;
use crate::state::CacheState;
use crate::store::ChangeFeed;

/// Turns stored bytes into a typed value.
pub type Decoder<T> = Arc<dyn Fn(&[u8]) -> CacheResult<T> + Send + Sync>;

/// Decoder for JSON payloads.
pub fn json_decoder<T: DeserializeOwned>() -> Decoder<T> {
    Arc::new(|bytes| {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Decoding {
            message: format!("failed to deserialize payload: {}", e),
        })
    })
}

struct Inner<T> {
    key: String,
    spec: RequestSpec,
    orchestrator: Arc<Orchestrator>,
    decoder: Decoder<T>,
    slot: Mutex<StateSlot<T>>,
    disposed: AtomicBool,
}

/// The state sender and the number of this resource's fetches in flight,
/// guarded together so `is_loading` always agrees with the count.
struct StateSlot<T> {
    tx: Option<watch::Sender<CacheState<T>>>,
    in_flight: usize,
}

impl<T> StateSlot<T> {
    fn publish(&self, f: impl FnOnce(&mut CacheState<T>)) {
        if let Some(tx) = self.tx.as_ref() {
            tx.send_modify(f);
        }
    }
}

/// One running fetch. Finishing (or dropping, if the fetch is cancelled)
/// clears `is_loading` once no other fetch of the resource is running.
struct InFlight<'a, T> {
    inner: &'a Inner<T>,
    finished: bool,
}

impl<'a, T> InFlight<'a, T> {
    fn start(inner: &'a Inner<T>) -> Self {
        inner.with_slot(|slot| {
            slot.in_flight += 1;
            slot.publish(|s| s.is_loading = true);
        });
        Self {
            inner,
            finished: false,
        }
    }

    fn finish(mut self, f: impl FnOnce(&mut CacheState<T>)) {
        self.finished = true;
        self.end(f);
    }

    fn end(&self, f: impl FnOnce(&mut CacheState<T>)) {
        self.inner.with_slot(|slot| {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            let idle = slot.in_flight == 0;
            slot.publish(|s| {
                f(s);
                if idle {
                    s.is_loading = false;
                }
            });
        });
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.end(|_| {});
        }
    }
}

struct Snapshot<T> {
    data: T,
    entry: CacheEntry,
    staleness: Staleness,
}

/// One observed resource.
pub struct Resource<T> {
    inner: Arc<Inner<T>>,
    state_rx: watch::Receiver<CacheState<T>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("key", &self.inner.key)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T> Resource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Bind `spec` to `orchestrator` and start observing.
    ///
    /// Subscribes to the store and the update bus, then triggers an initial
    /// non-forced fetch in the background. Must be called inside a tokio
    /// runtime.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        spec: RequestSpec,
        decoder: Decoder<T>,
    ) -> CacheResult<Self> {
        let key = spec.cache_key()?;
        let (state_tx, state_rx) = watch::channel(CacheState::loading());

        let feed = orchestrator.store().subscribe();
        let updates = orchestrator.bus().subscribe();

        let inner = Arc::new(Inner {
            key,
            spec,
            orchestrator,
            decoder,
            slot: Mutex::new(StateSlot {
                tx: Some(state_tx),
                in_flight: 0,
            }),
            disposed: AtomicBool::new(false),
        });

        let listener = tokio::spawn(Arc::clone(&inner).listen(feed, updates));

        let initial = Arc::clone(&inner);
        let initial_fetch = tokio::spawn(async move {
            // Failures are already reflected in the state.
            let _ = initial.fetch(false).await;
        });

        debug!(key = %inner.key, "resource created");
        Ok(Self {
            inner,
            state_rx,
            tasks: Mutex::new(vec![listener.abort_handle(), initial_fetch.abort_handle()]),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The current snapshot.
    pub fn state(&self) -> CacheState<T> {
        self.state_rx.borrow().clone()
    }

    /// A receiver that starts at the current snapshot and closes on dispose.
    pub fn subscribe(&self) -> watch::Receiver<CacheState<T>> {
        self.state_rx.clone()
    }

    /// Fetch, using the cache unless `force_refresh`.
    pub async fn fetch(&self, force_refresh: bool) -> CacheResult<FetchOutcome> {
        self.inner.fetch(force_refresh).await
    }

    /// Fetch bypassing freshness.
    pub async fn refresh(&self) -> CacheResult<FetchOutcome> {
        self.fetch(true).await
    }

    /// Drop this resource's cached entry.
    pub async fn invalidate(&self) -> CacheResult<bool> {
        self.inner.ensure_live()?;
        self.inner.orchestrator.invalidate_key(&self.inner.key).await
    }

    /// Stop observing: cancel listeners and close the state stream.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release();
        debug!(key = %self.inner.key, "resource disposed");
    }
}

impl<T> Resource<T> {
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn release(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.inner.with_slot(|slot| slot.tx.take());
    }
}

impl<T> Drop for Resource<T> {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.release();
    }
}

impl<T> Inner<T> {
    fn with_slot<R>(&self, f: impl FnOnce(&mut StateSlot<T>) -> R) -> R {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut slot)
    }

    fn update(&self, f: impl FnOnce(&mut CacheState<T>)) {
        self.with_slot(|slot| slot.publish(f));
    }

    /// Clear `is_loading` unless one of our own fetches is still running.
    fn settle_loading(&self) {
        self.with_slot(|slot| {
            if slot.in_flight == 0 {
                slot.publish(|s| s.is_loading = false);
            }
        });
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn ensure_live(&self) -> CacheResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::NotInitialized {
                message: format!("resource {} has been disposed", self.key),
            });
        }
        Ok(())
    }

    async fn fetch(&self, force_refresh: bool) -> CacheResult<FetchOutcome> {
        self.ensure_live()?;
        let in_flight = InFlight::start(self);

        let validate = |bytes: &[u8]| (self.decoder)(bytes).map(|_| ());
        match self
            .orchestrator
            .fetch_with(&self.spec, force_refresh, &validate)
            .await
        {
            Ok(outcome) => {
                let read = self.read_entry().await;
                in_flight.finish(|s| {
                    s.error = None;
                    apply_read(s, read);
                });
                Ok(outcome)
            }
            Err(e) => {
                in_flight.finish(|s| s.error = Some(e.clone()));
                Err(e)
            }
        }
    }

    async fn reload(&self) {
        let read = self.read_entry().await;
        self.update(|s| apply_read(s, read));
    }

    async fn read_entry(&self) -> CacheResult<Option<Snapshot<T>>> {
        let Some(entry) = self.orchestrator.store().get(&self.key).await? else {
            return Ok(None);
        };
        let bytes = self
            .orchestrator
            .cipher()
            .open(&self.key, &entry.payload)?;
        let data = (self.decoder)(&bytes)?;
        let staleness = entry.staleness(self.orchestrator.now());
        Ok(Some(Snapshot {
            data,
            entry,
            staleness,
        }))
    }

    async fn listen(self: Arc<Self>, mut feed: ChangeFeed, mut updates: UpdateSubscription) {
        loop {
            tokio::select! {
                change = feed.recv() => match change {
                    Some(change) if change.affects(&self.key) => self.reload().await,
                    Some(_) => {}
                    None => break,
                },
                message = updates.recv() => match message {
                    Some(BusMessage::Event(event)) if event.key == self.key => {
                        self.reload().await;
                        if event.kind == UpdateKind::Completed {
                            self.settle_loading();
                        }
                    }
                    Some(BusMessage::Lagged(_)) => self.reload().await,
                    Some(_) => {}
                    None => break,
                },
            }
        }
        debug!(key = %self.key, "resource listener stopped");
    }
}

fn apply_read<T>(state: &mut CacheState<T>, read: CacheResult<Option<Snapshot<T>>>) {
    match read {
        Ok(Some(snapshot)) => {
            state.data = Some(snapshot.data);
            state.is_stale = snapshot.staleness.is_stale();
            state.timestamp = Some(snapshot.entry.timestamp);
            state.ttl_secs = Some(snapshot.entry.ttl_secs);
            state.etag = snapshot.entry.etag;
            if state.error.as_ref().is_some_and(is_read_error) {
                state.error = None;
            }
        }
        Ok(None) => {
            state.data = None;
            state.is_stale = false;
            state.timestamp = None;
            state.ttl_secs = None;
            state.etag = None;
            if state.error.as_ref().is_some_and(is_read_error) {
                state.error = None;
            }
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "failed to read cached entry");
            state.error = Some(e);
        }
    }
}

/// Errors produced by reading the store, which a later successful read
/// supersedes.
fn is_read_error(error: &CacheError) -> bool {
    matches!(
        error,
        CacheError::Decoding { .. }
            | CacheError::EncryptionUnavailable { .. }
            | CacheError::Crypto { .. }
            | CacheError::Store { .. }
    )
}
