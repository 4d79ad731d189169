//! Stale-while-revalidate cache for remote JSON resources.
//!
//! This crate provides:
//!
//! - Persistent cache entries in SQLite, optionally encrypted with AES-256-GCM
//! - Conditional revalidation with `ETag` / `If-None-Match`
//! - TTL staleness, overridable per request and by `Cache-Control: max-age`
//! - An update bus announcing finished fetches and invalidations
//! - Per-resource repositories publishing a typed state stream
//!
//! # Quick Start
//!
//! ```no_run
//! use reval_cache::{CacheConfig, ReactiveCache, RequestSpec};
//!
//! #[derive(Debug, Clone, serde::Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! # async fn example() -> reval_cache::CacheResult<()> {
//! let cache = ReactiveCache::init_http(CacheConfig::from_env())?;
//!
//! let users = cache.resource::<Vec<User>>(
//!     RequestSpec::get("https://api.example.com/users").with_ttl(60),
//! )?;
//!
//! let mut states = users.subscribe();
//! while states.changed().await.is_ok() {
//!     let state = states.borrow_and_update().clone();
//!     if let Some(users) = &state.data {
//!         println!("{} users (stale: {})", users.len(), state.is_stale);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `REVAL_CACHE_DB` | SQLite path (default: platform cache dir, `:memory:` for in-memory) |
//! | `REVAL_DEFAULT_TTL` | Default TTL in seconds (default: 300) |
//! | `REVAL_ENCRYPTION` | Encrypt new entries (`1`/`true`) |
//! | `REVAL_ENCRYPTION_KEY` | Base64 AES-256 key (generated when absent) |
//! | `REVAL_BUS_CAPACITY` | Update bus buffer per subscriber (default: 256) |
//! | `REVAL_HTTP_TIMEOUT` | Request timeout in seconds (default: 30) |
//! | `REVAL_HTTP_MAX_RETRIES` | Retries for transient failures (default: 0) |

pub mod bus;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod orchestrator;
pub mod repository;
pub mod request;
pub mod runtime;
pub mod staleness;
pub mod state;
pub mod store;
pub mod transport;

// Re-export main types
pub use bus::{BusMessage, UpdateBus, UpdateEvent, UpdateKind, UpdateSubscription};
pub use cipher::Cipher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::{CacheEntry, Payload};
pub use error::{CacheError, CacheResult};
pub use key::{derive_key, KeyFn};
pub use orchestrator::{FetchOutcome, Orchestrator, Validator};
pub use repository::{json_decoder, Decoder, Resource};
pub use request::{Extractor, RequestSpec};
pub use runtime::ReactiveCache;
pub use staleness::{classify, Staleness};
pub use state::CacheState;
pub use store::{ChangeFeed, EntryStore, SqliteStore, StoreChange};
pub use transport::{HttpTransport, Transport, TransportRequest, TransportResponse};

// Callers build `RequestSpec`s with these.
pub use reqwest::header::HeaderMap;
pub use reqwest::Method;
