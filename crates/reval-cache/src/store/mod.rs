//! Cache entry persistence.
//!
//! The store is the single source of truth for cached responses. Any number
//! of concurrent fetches may write to it; each key holds exactly one row and
//! the last accepted write wins.
//!
//! Every store also exposes a collection-wide change feed. A fresh
//! subscription yields [`StoreChange::Snapshot`] first so the subscriber
//! can read its initial state, then one event per upsert/delete across all
//! keys. Subscribers filter by key themselves.

mod schema;
pub mod sqlite;

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::entry::CacheEntry;
use crate::error::CacheResult;

pub use sqlite::SqliteStore;

/// Capacity of the change-feed buffer before slow subscribers lag.
pub const CHANGE_FEED_CAPACITY: usize = 1024;

/// A change to the entry collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Re-read everything: initial signal, or the subscriber fell behind.
    Snapshot,
    Upserted(String),
    Deleted(String),
    Cleared,
}

impl StoreChange {
    /// Whether a subscriber watching `key` should re-read its entry.
    pub fn affects(&self, key: &str) -> bool {
        match self {
            Self::Snapshot | Self::Cleared => true,
            Self::Upserted(k) | Self::Deleted(k) => k == key,
        }
    }
}

/// Subscription to a store's change feed.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: broadcast::Receiver<StoreChange>,
    primed: bool,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<StoreChange>) -> Self {
        Self { rx, primed: true }
    }

    /// Next change, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        if std::mem::take(&mut self.primed) {
            return Some(StoreChange::Snapshot);
        }

        match self.rx.recv().await {
            Ok(change) => Some(change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "store change feed lagged, resynchronizing");
                Some(StoreChange::Snapshot)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Key-unique persistence for cache entries.
#[async_trait]
pub trait EntryStore: Debug + Send + Sync {
    /// Fetch the entry for `key`.
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Insert or replace the entry for `entry.key`.
    ///
    /// A write carrying an older timestamp than the stored row is ignored,
    /// so an entry is never backdated.
    async fn upsert(&self, entry: &CacheEntry) -> CacheResult<()>;

    /// Delete the entry for `key`. Returns whether a row was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// All stored keys, sorted.
    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Delete every entry, returning the keys removed.
    async fn clear(&self) -> CacheResult<Vec<String>>;

    /// Subscribe to collection-wide changes.
    fn subscribe(&self) -> ChangeFeed;
}
