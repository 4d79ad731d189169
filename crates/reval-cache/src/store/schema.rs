//! SQLite schema for cached responses.
//!
//! Tables:
//! - `cache_entries`: one row per cache key

/// DDL for the entry table.
///
/// Schema version: 1
pub(crate) const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key           TEXT PRIMARY KEY NOT NULL,
    payload       BLOB NOT NULL,
    iv            BLOB,
    is_encrypted  INTEGER NOT NULL DEFAULT 0,
    etag          TEXT,
    timestamp_ms  INTEGER NOT NULL,
    ttl_secs      INTEGER NOT NULL CHECK (ttl_secs >= 0),
    is_stale      INTEGER NOT NULL DEFAULT 0,
    CHECK ((is_encrypted = 1) = (iv IS NOT NULL))
);
"#;

/// Upsert that refuses to move `timestamp_ms` backwards.
pub(crate) const UPSERT_ENTRY: &str = r#"
INSERT INTO cache_entries (
    key, payload, iv, is_encrypted, etag, timestamp_ms, ttl_secs, is_stale
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(key) DO UPDATE SET
    payload      = excluded.payload,
    iv           = excluded.iv,
    is_encrypted = excluded.is_encrypted,
    etag         = excluded.etag,
    timestamp_ms = excluded.timestamp_ms,
    ttl_secs     = excluded.ttl_secs,
    is_stale     = excluded.is_stale
WHERE excluded.timestamp_ms >= cache_entries.timestamp_ms
"#;

pub(crate) const SELECT_ENTRY: &str = r#"
SELECT key, payload, iv, is_encrypted, etag, timestamp_ms, ttl_secs, is_stale
FROM cache_entries WHERE key = ?1
"#;
