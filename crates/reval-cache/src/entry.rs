//! The persisted cache row.

use chrono::{DateTime, Utc};

use crate::staleness::{classify, Staleness};

/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 12;

/// Initialization vector for one encrypted payload.
pub type Iv = [u8; IV_LEN];

/// Stored response body.
///
/// Plaintext and ciphertext rows coexist while encryption is being switched
/// on or off, so each row records its own codec. An encrypted payload
/// always carries its IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Plain(Vec<u8>),
    Encrypted { ciphertext: Vec<u8>, iv: Iv },
}

impl Payload {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }

    pub fn iv(&self) -> Option<&Iv> {
        match self {
            Self::Plain(_) => None,
            Self::Encrypted { iv, .. } => Some(iv),
        }
    }

    /// Raw stored bytes (ciphertext for encrypted payloads).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Plain(bytes) => bytes,
            Self::Encrypted { ciphertext, .. } => ciphertext,
        }
    }
}

/// One row per cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unique cache key.
    pub key: String,

    /// Response body, plaintext or encrypted.
    pub payload: Payload,

    /// Last validator returned by the remote endpoint.
    pub etag: Option<String>,

    /// When the entry was last confirmed fresh.
    pub timestamp: DateTime<Utc>,

    /// Lifetime in seconds.
    pub ttl_secs: u64,

    /// Staleness as of the last write. Recompute with
    /// [`CacheEntry::staleness`] when accuracy matters.
    pub is_stale: bool,
}

impl CacheEntry {
    pub fn staleness(&self, now: DateTime<Utc>) -> Staleness {
        classify(self.timestamp, self.ttl_secs, now)
    }

    pub fn is_encrypted(&self) -> bool {
        self.payload.is_encrypted()
    }
}
