//! Pure helpers: header parsing and retry backoff (no I/O).

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, CACHE_CONTROL, RETRY_AFTER};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `max-age` from a `Cache-Control` header, in seconds.
pub fn parse_max_age(headers: &HeaderMap) -> Option<u64> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cc| cc.split(','))
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")
                .and_then(|v| v.trim_matches('"').parse::<u64>().ok())
        })
}

/// `Retry-After` in delta-seconds form.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Delay before retry number `attempt` (1-based).
///
/// A server-supplied `Retry-After` is honoured (capped at 30 s, ±10 %
/// jitter); otherwise full-jitter exponential backoff capped at 30 s.
pub(crate) fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(retry_after) => {
            let capped = retry_after.min(MAX_BACKOFF);
            let base_ms = capped.as_millis() as u64;
            let jitter_factor: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
            let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
            Duration::from_millis(jittered_ms.max(100))
        }
        None => {
            let base_backoff = Duration::from_secs(1_u64 << attempt.min(5)).min(MAX_BACKOFF);
            let jittered_ms = rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
            Duration::from_millis(jittered_ms.max(10))
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}
