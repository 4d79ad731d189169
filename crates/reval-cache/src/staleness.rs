//! Freshness classification for cache entries.
//!
//! Staleness only drives revalidation. Nothing here ever purges an entry;
//! retention is left to explicit invalidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of classifying an entry against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Staleness {
    Fresh,
    Stale,
}

impl Staleness {
    pub fn is_stale(self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// Classify an entry confirmed at `timestamp` with a lifetime of `ttl_secs`.
///
/// Stale iff `now - timestamp >= ttl_secs`. A TTL of zero is therefore
/// always stale. A timestamp in the future (clock skew) counts as age zero.
pub fn classify(timestamp: DateTime<Utc>, ttl_secs: u64, now: DateTime<Utc>) -> Staleness {
    let age_ms = now
        .signed_duration_since(timestamp)
        .num_milliseconds()
        .max(0);
    let ttl_ms = i64::try_from(ttl_secs)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .unwrap_or(i64::MAX);

    if age_ms >= ttl_ms {
        Staleness::Stale
    } else {
        Staleness::Fresh
    }
}
