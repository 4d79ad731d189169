//! Typed snapshot published by a repository.

use chrono::{DateTime, Utc};

use crate::error::CacheError;

/// What an observer of one resource currently knows.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheState<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub is_stale: bool,
    pub error: Option<CacheError>,
    pub timestamp: Option<DateTime<Utc>>,
    pub ttl_secs: Option<u64>,
    pub etag: Option<String>,
}

impl<T> Default for CacheState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_stale: false,
            error: None,
            timestamp: None,
            ttl_secs: None,
            etag: None,
        }
    }
}

impl<T> CacheState<T> {
    /// Initial state of a repository: loading, nothing known yet.
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            ..Self::default()
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_data() && !self.is_loading && !self.has_error()
    }
}
