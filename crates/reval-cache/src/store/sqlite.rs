//! SQLite-backed entry store.
//!
//! A single connection behind a mutex; blocking calls run on the tokio
//! blocking pool. The primary key on `cache_entries.key` enforces one row
//! per cache key and the upsert is a single atomic statement.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::debug;

use super::schema::{CACHE_SCHEMA, SELECT_ENTRY, UPSERT_ENTRY};
use super::{ChangeFeed, EntryStore, StoreChange, CHANGE_FEED_CAPACITY};
use crate::entry::{CacheEntry, Iv, Payload};
use crate::error::{CacheError, CacheResult};

/// SQLite-backed entry store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    /// Open a file-backed store, creating parent directories as needed.
    pub fn open(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::store(format!("failed to create store directory: {}", e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL mode for file-backed DBs
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL");
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> CacheResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> CacheResult<Self> {
        conn.execute_batch(CACHE_SCHEMA)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    async fn with_conn<F, R>(&self, f: F) -> CacheResult<R>
    where
        F: FnOnce(&Connection) -> CacheResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| CacheError::store("connection mutex poisoned"))?;
            f(&conn)
        })
        .await
        .map_err(|e| CacheError::store(format!("store task failed: {}", e)))?
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        key: row.get(0)?,
        payload: row.get(1)?,
        iv: row.get(2)?,
        is_encrypted: row.get(3)?,
        etag: row.get(4)?,
        timestamp_ms: row.get(5)?,
        ttl_secs: row.get(6)?,
        is_stale: row.get(7)?,
    })
}

struct RawEntry {
    key: String,
    payload: Vec<u8>,
    iv: Option<Vec<u8>>,
    is_encrypted: bool,
    etag: Option<String>,
    timestamp_ms: i64,
    ttl_secs: i64,
    is_stale: bool,
}

impl RawEntry {
    fn into_entry(self) -> CacheResult<CacheEntry> {
        let payload = match (self.is_encrypted, self.iv) {
            (false, None) => Payload::Plain(self.payload),
            (true, Some(iv)) => {
                let iv: Iv = iv.as_slice().try_into().map_err(|_| {
                    CacheError::store(format!(
                        "entry {} has an IV of {} bytes",
                        self.key,
                        iv.len()
                    ))
                })?;
                Payload::Encrypted {
                    ciphertext: self.payload,
                    iv,
                }
            }
            _ => {
                return Err(CacheError::store(format!(
                    "entry {} has inconsistent encryption columns",
                    self.key
                )))
            }
        };

        let timestamp = DateTime::from_timestamp_millis(self.timestamp_ms).ok_or_else(|| {
            CacheError::store(format!(
                "entry {} has invalid timestamp {}",
                self.key, self.timestamp_ms
            ))
        })?;

        Ok(CacheEntry {
            key: self.key,
            payload,
            etag: self.etag,
            timestamp,
            ttl_secs: u64::try_from(self.ttl_secs).unwrap_or(0),
            is_stale: self.is_stale,
        })
    }
}

#[async_trait]
impl EntryStore for SqliteStore {
    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let key = key.to_string();
        let raw = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(SELECT_ENTRY, [&key], row_to_entry)
                    .optional()?)
            })
            .await?;
        raw.map(RawEntry::into_entry).transpose()
    }

    async fn upsert(&self, entry: &CacheEntry) -> CacheResult<()> {
        let entry = entry.clone();
        let key = entry.key.clone();
        let changed = self
            .with_conn(move |conn| {
                let ttl = i64::try_from(entry.ttl_secs).unwrap_or(i64::MAX);
                let changed = conn.execute(
                    UPSERT_ENTRY,
                    params![
                        entry.key,
                        entry.payload.as_bytes(),
                        entry.payload.iv().map(|iv| iv.to_vec()),
                        entry.payload.is_encrypted(),
                        entry.etag,
                        entry.timestamp.timestamp_millis(),
                        ttl,
                        entry.is_stale,
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            debug!(key = %key, "upsert ignored: stored entry is newer");
            return Ok(());
        }

        debug!(key = %key, "entry stored");
        self.notify(StoreChange::Upserted(key));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let owned = key.to_string();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute("DELETE FROM cache_entries WHERE key = ?1", [&owned])?)
            })
            .await?;

        if removed > 0 {
            debug!(key, "entry deleted");
            self.notify(StoreChange::Deleted(key.to_string()));
        }
        Ok(removed > 0)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn clear(&self) -> CacheResult<Vec<String>> {
        let removed = self
            .with_conn(|conn| {
                conn.execute("BEGIN IMMEDIATE", [])?;
                let result = (|| {
                    let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
                    let keys = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    conn.execute("DELETE FROM cache_entries", [])?;
                    Ok::<_, rusqlite::Error>(keys)
                })();

                match result {
                    Ok(keys) => {
                        conn.execute("COMMIT", [])?;
                        Ok(keys)
                    }
                    Err(e) => {
                        let _ = conn.execute("ROLLBACK", []);
                        Err(e.into())
                    }
                }
            })
            .await?;

        if !removed.is_empty() {
            debug!(count = removed.len(), "store cleared");
            self.notify(StoreChange::Cleared);
        }
        Ok(removed)
    }

    fn subscribe(&self) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe())
    }
}
