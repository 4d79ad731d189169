//! Error types for the reactive cache.

/// Cache errors.
///
/// Every variant carries owned strings so an error can be cloned into a
/// [`CacheState`](crate::state::CacheState) snapshot and handed to any
/// number of observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Network failure or a status the cache does not accept.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Key derivation or request body serialization failed.
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// A stored or fetched payload could not be deserialized.
    #[error("decoding error: {message}")]
    Decoding { message: String },

    /// An encrypted entry was read while encryption is disabled.
    #[error("entry {key} is encrypted but encryption is disabled")]
    EncryptionUnavailable { key: String },

    /// Encryption or decryption itself failed (bad tag, bad IV).
    #[error("crypto error: {message}")]
    Crypto { message: String },

    /// Persistence failure.
    #[error("store error: {message}")]
    Store { message: String },

    /// A cache operation ran before initialization or after shutdown.
    #[error("cache not initialized: {message}")]
    NotInitialized { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl CacheError {
    pub(crate) fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Stable label for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Encoding { .. } => "encoding",
            Self::Decoding { .. } => "decoding",
            Self::EncryptionUnavailable { .. } => "encryption_unavailable",
            Self::Crypto { .. } => "crypto",
            Self::Store { .. } => "store",
            Self::NotInitialized { .. } => "not_initialized",
            Self::Config { .. } => "config",
        }
    }

    /// HTTP status of a transport failure, if the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether a transport may retry the request that produced this error.
    ///
    /// The orchestrator never retries on its own; only the HTTP transport
    /// consults this, and only when configured with `max_retries > 0`.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status: None, .. } => true,
            Self::Transport {
                status: Some(status),
                ..
            } => *status == 429 || (500..=599).contains(status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        Self::store(err.to_string())
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
