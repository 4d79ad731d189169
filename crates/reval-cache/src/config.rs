//! Cache configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cipher::Cipher;
use crate::error::{CacheError, CacheResult};

/// Path value selecting an in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Process-wide cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// SQLite database path. `None` uses the platform cache directory;
    /// `":memory:"` keeps everything in memory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// TTL applied when neither the request nor the response supplies one.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Whether new entries are encrypted at rest.
    #[serde(default)]
    pub encryption_enabled: bool,

    /// Base64 AES-256 key. Generated at init when absent.
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,

    /// Per-subscriber buffer of the update bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport-level retries for transient failures.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_bus_capacity() -> usize {
    crate::bus::DEFAULT_BUS_CAPACITY
}

fn default_timeout() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            default_ttl_secs: default_ttl_secs(),
            encryption_enabled: false,
            encryption_key: None,
            bus_capacity: default_bus_capacity(),
            timeout_secs: default_timeout(),
            max_retries: 0,
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `REVAL_CACHE_DB` | Database path (`:memory:` for in-memory) |
    /// | `REVAL_DEFAULT_TTL` | Default TTL in seconds |
    /// | `REVAL_ENCRYPTION` | Encrypt new entries (`1`/`true`) |
    /// | `REVAL_ENCRYPTION_KEY` | Base64 AES-256 key |
    /// | `REVAL_BUS_CAPACITY` | Update bus buffer per subscriber |
    /// | `REVAL_HTTP_TIMEOUT` | Request timeout in seconds |
    /// | `REVAL_HTTP_MAX_RETRIES` | Transport retries |
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("REVAL_CACHE_DB").ok().map(PathBuf::from),
            default_ttl_secs: env_parse("REVAL_DEFAULT_TTL").unwrap_or_else(default_ttl_secs),
            encryption_enabled: std::env::var("REVAL_ENCRYPTION")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            encryption_key: std::env::var("REVAL_ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            bus_capacity: env_parse("REVAL_BUS_CAPACITY").unwrap_or_else(default_bus_capacity),
            timeout_secs: env_parse("REVAL_HTTP_TIMEOUT").unwrap_or_else(default_timeout),
            max_retries: env_parse("REVAL_HTTP_MAX_RETRIES").unwrap_or(0),
        }
    }

    /// In-memory database, everything else default.
    pub fn in_memory() -> Self {
        Self::default().with_database_path(IN_MEMORY)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_default_ttl(mut self, ttl_secs: u64) -> Self {
        self.default_ttl_secs = ttl_secs;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    pub fn with_encryption_key(mut self, key_base64: impl Into<String>) -> Self {
        self.encryption_key = Some(key_base64.into());
        self
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Check values that would otherwise fail later, deep inside init.
    pub fn validate(&self) -> CacheResult<()> {
        if self.bus_capacity == 0 {
            return Err(CacheError::Config {
                message: "bus_capacity must be at least 1".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(CacheError::Config {
                message: "timeout_secs must be at least 1".to_string(),
            });
        }
        if let Some(key) = &self.encryption_key {
            Cipher::from_base64_key(key, false)?;
        }
        Ok(())
    }

    /// Resolved database location; `None` means in-memory.
    pub fn resolved_database_path(&self) -> CacheResult<Option<PathBuf>> {
        match &self.database_path {
            Some(path) if path.as_os_str() == IN_MEMORY => Ok(None),
            Some(path) => Ok(Some(path.clone())),
            None => {
                let base = dirs::cache_dir()
                    .or_else(dirs::home_dir)
                    .ok_or_else(|| CacheError::Config {
                        message: "could not determine cache directory".to_string(),
                    })?;
                Ok(Some(base.join("reval").join("cache.db")))
            }
        }
    }

    /// Build the cipher described by this config.
    pub fn build_cipher(&self) -> CacheResult<Cipher> {
        match &self.encryption_key {
            Some(key) => Cipher::from_base64_key(key, self.encryption_enabled),
            None if self.encryption_enabled => Ok(Cipher::generate(true)),
            None => Ok(Cipher::disabled()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
