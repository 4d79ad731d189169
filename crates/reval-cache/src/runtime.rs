//! Process-wide setup and the handle repositories are created from.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::bus::UpdateBus;
use crate::cipher::Cipher;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::orchestrator::{FetchOutcome, Orchestrator};
use crate::repository::{json_decoder, Decoder, Resource};
use crate::request::RequestSpec;
use crate::store::{EntryStore, SqliteStore};
use crate::transport::{HttpTransport, Transport};

/// An initialized cache: store, cipher, bus and orchestrator wired together.
///
/// Cloning is cheap and every clone shares the same components.
#[derive(Debug, Clone)]
pub struct ReactiveCache {
    orchestrator: Arc<Orchestrator>,
}

impl ReactiveCache {
    /// Set up the cache from `config` with the given transport.
    pub fn init(config: CacheConfig, transport: Arc<dyn Transport>) -> CacheResult<Self> {
        Self::init_with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Like [`ReactiveCache::init`], with an explicit clock.
    pub fn init_with_clock(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let store = match config.resolved_database_path()? {
            Some(path) => SqliteStore::open(&path)?,
            None => SqliteStore::memory()?,
        };
        let cipher = config.build_cipher()?;
        let bus = UpdateBus::new(config.bus_capacity);

        info!(
            database = ?config.resolved_database_path()?,
            encryption = cipher.is_enabled(),
            default_ttl_secs = config.default_ttl_secs,
            "cache initialized"
        );

        Ok(Self::from_parts(
            Arc::new(store),
            transport,
            Arc::new(cipher),
            bus,
            clock,
            config.default_ttl_secs,
        ))
    }

    /// Set up the cache with the reqwest-backed transport.
    pub fn init_http(config: CacheConfig) -> CacheResult<Self> {
        let transport = HttpTransport::from_config(&config)?;
        Self::init(config, Arc::new(transport))
    }

    /// Set up the cache from `REVAL_*` environment variables.
    pub fn from_env() -> CacheResult<Self> {
        Self::init_http(CacheConfig::from_env())
    }

    /// Wire already-built components.
    pub fn from_parts(
        store: Arc<dyn EntryStore>,
        transport: Arc<dyn Transport>,
        cipher: Arc<Cipher>,
        bus: UpdateBus,
        clock: Arc<dyn Clock>,
        default_ttl_secs: u64,
    ) -> Self {
        let orchestrator = Orchestrator::new(store, transport, cipher, bus)
            .with_clock(clock)
            .with_default_ttl(default_ttl_secs);
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn cipher(&self) -> &Arc<Cipher> {
        self.orchestrator.cipher()
    }

    pub fn bus(&self) -> &UpdateBus {
        self.orchestrator.bus()
    }

    /// A repository that decodes the cached body as JSON.
    pub fn resource<T>(&self, spec: RequestSpec) -> CacheResult<Resource<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.resource_with(spec, json_decoder::<T>())
    }

    /// A repository with a custom decoder.
    pub fn resource_with<T>(&self, spec: RequestSpec, decoder: Decoder<T>) -> CacheResult<Resource<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.ensure_open()?;
        Resource::new(Arc::clone(&self.orchestrator), spec, decoder)
    }

    pub async fn fetch(&self, spec: &RequestSpec, force_refresh: bool) -> CacheResult<FetchOutcome> {
        self.orchestrator.fetch(spec, force_refresh).await
    }

    pub async fn invalidate(&self, spec: &RequestSpec) -> CacheResult<bool> {
        self.orchestrator.invalidate(spec).await
    }

    pub async fn clear(&self) -> CacheResult<usize> {
        self.orchestrator.clear().await
    }

    /// Close the cache. Every later operation fails with `NotInitialized`.
    pub fn shutdown(&self) {
        if !self.orchestrator.is_closed() {
            self.orchestrator.close();
            info!("cache shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.orchestrator.is_closed()
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.is_shut_down() {
            return Err(CacheError::NotInitialized {
                message: "cache has been shut down".to_string(),
            });
        }
        Ok(())
    }
}
