//! Store creation and lookup
//!
//! [`StoreBuilder`] turns a validated [`StoreConfig`] into an open [`Store`].
//! [`StoreRegistry`] keeps the stores of one processing node by name so a
//! flush task or shutdown hook can reach all of them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::changelog::ChangelogSink;
use crate::clock::{Clock, SystemClock};
use crate::config::{StoreConfig, StoreKind};
use crate::engine::{
    EngineProvider, LruEngine, MemoryEngine, MemoryEngineProvider, SledEngineProvider,
};
use crate::error::{StoreError, StoreResult};
use crate::kv::KeyValueStore;
use crate::lifecycle::{StateStore, StoreLifecycle};
use crate::session::{LastWriteWins, SessionCombiner, SessionStore};
use crate::window::WindowStore;

/// An open store of any kind
#[derive(Debug)]
pub enum Store {
    KeyValue(KeyValueStore),
    Lru(KeyValueStore),
    InMemory(KeyValueStore),
    Window(WindowStore),
    Session(SessionStore),
}

impl Store {
    pub fn kind(&self) -> StoreKind {
        match self {
            Store::KeyValue(_) => StoreKind::KvRegular,
            Store::Lru(_) => StoreKind::KvLru,
            Store::InMemory(_) => StoreKind::KvInMemory,
            Store::Window(_) => StoreKind::Window,
            Store::Session(_) => StoreKind::Session,
        }
    }

    pub fn as_key_value(&self) -> Option<&KeyValueStore> {
        match self {
            Store::KeyValue(store) | Store::Lru(store) | Store::InMemory(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<&WindowStore> {
        match self {
            Store::Window(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_session(&self) -> Option<&SessionStore> {
        match self {
            Store::Session(store) => Some(store),
            _ => None,
        }
    }

    fn inner(&self) -> &dyn StateStore {
        match self {
            Store::KeyValue(store) | Store::Lru(store) | Store::InMemory(store) => store,
            Store::Window(store) => store,
            Store::Session(store) => store,
        }
    }
}

impl StateStore for Store {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn is_open(&self) -> bool {
        self.inner().is_open()
    }

    fn is_persistent(&self) -> bool {
        self.inner().is_persistent()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner().flush()
    }

    fn close(&self) -> StoreResult<()> {
        self.inner().close()
    }

    fn open_cursors(&self) -> usize {
        self.inner().open_cursors()
    }
}

/// Builder of open stores
pub struct StoreBuilder {
    config: StoreConfig,
    changelog: Option<Arc<dyn ChangelogSink>>,
    clock: Arc<dyn Clock>,
    combiner: Arc<dyn SessionCombiner>,
    provider: Option<Arc<dyn EngineProvider>>,
}

impl StoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            changelog: None,
            clock: Arc::new(SystemClock),
            combiner: Arc::new(LastWriteWins),
            provider: None,
        }
    }

    /// Sink receiving the store's changelog; required when the changelog is enabled
    pub fn with_changelog(mut self, sink: Arc<dyn ChangelogSink>) -> Self {
        self.changelog = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Value combiner for session merges
    pub fn with_session_combiner(mut self, combiner: Arc<dyn SessionCombiner>) -> Self {
        self.combiner = combiner;
        self
    }

    /// Engine provider shared with other stores, e.g. one sled database
    pub fn with_engine_provider(mut self, provider: Arc<dyn EngineProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Validate the configuration and open the store
    pub fn build(self) -> StoreResult<Store> {
        let config = self.config;
        config.validate()?;

        let changelog = match (config.changelog_enabled, self.changelog) {
            (true, None) => {
                return Err(StoreError::configuration(format!(
                    "changelog enabled for store {} but no sink attached",
                    config.name
                )))
            }
            (true, sink) => sink,
            (false, Some(_)) => {
                debug!(
                    "Changelog disabled for store {}; ignoring attached sink",
                    config.name
                );
                None
            }
            (false, None) => None,
        };

        let lifecycle = StoreLifecycle::new(&config.name, config.is_persistent(), changelog);
        let clock = self.clock;

        let store = match config.kind {
            StoreKind::KvRegular => {
                let provider = match self.provider {
                    Some(provider) => provider,
                    None => sled_provider(&config)?,
                };
                let engine = provider.open(&config.name)?;
                Store::KeyValue(KeyValueStore::new(
                    &config,
                    lifecycle,
                    engine,
                    Some(provider),
                    clock,
                ))
            }
            StoreKind::KvInMemory => {
                let engine = Arc::new(MemoryEngine::new(config.name.clone()));
                Store::InMemory(KeyValueStore::new(&config, lifecycle, engine, None, clock))
            }
            StoreKind::KvLru => {
                let capacity = config.lru_size.unwrap_or_default();
                let engine = Arc::new(LruEngine::new(config.name.clone(), capacity));
                Store::Lru(KeyValueStore::new(&config, lifecycle, engine, None, clock))
            }
            StoreKind::Window => {
                let provider = segment_provider(&config, self.provider)?;
                Store::Window(WindowStore::new(&config, lifecycle, provider, clock)?)
            }
            StoreKind::Session => {
                let provider = segment_provider(&config, self.provider)?;
                Store::Session(SessionStore::new(
                    &config,
                    lifecycle,
                    provider,
                    self.combiner,
                    clock,
                )?)
            }
        };
        Ok(store)
    }
}

fn sled_provider(config: &StoreConfig) -> StoreResult<Arc<dyn EngineProvider>> {
    let provider = match &config.data_dir {
        Some(dir) => SledEngineProvider::open(dir)?,
        None => SledEngineProvider::temporary()?,
    };
    Ok(Arc::new(provider))
}

fn segment_provider(
    config: &StoreConfig,
    provider: Option<Arc<dyn EngineProvider>>,
) -> StoreResult<Arc<dyn EngineProvider>> {
    match provider {
        Some(provider) => Ok(provider),
        None if config.persistent => sled_provider(config),
        None => Ok(Arc::new(MemoryEngineProvider::new())),
    }
}

/// Concurrent map of open stores by name
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<Store>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a store; names must be unique
    pub fn register(&self, store: Store) -> StoreResult<Arc<Store>> {
        match self.stores.entry(store.name().to_string()) {
            Entry::Occupied(entry) => Err(StoreError::configuration(format!(
                "store {} is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                let store = Arc::new(store);
                entry.insert(Arc::clone(&store));
                debug!("Registered store {}", store.name());
                Ok(store)
            }
        }
    }

    /// Build a store and register it
    pub fn build(&self, builder: StoreBuilder) -> StoreResult<Arc<Store>> {
        self.register(builder.build()?)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.remove(name).map(|(_, store)| store)
    }

    /// Registered store names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Flush every open store; reports the first failure after trying all
    pub fn flush_all(&self) -> StoreResult<()> {
        self.for_each_store("flush", |store| {
            if store.is_open() {
                store.flush()
            } else {
                Ok(())
            }
        })
    }

    /// Close every store; reports the first failure after trying all
    pub fn close_all(&self) -> StoreResult<()> {
        let result = self.for_each_store("close", |store| store.close());
        info!("Closed {} stores", self.stores.len());
        result
    }

    fn for_each_store<F>(&self, action: &str, f: F) -> StoreResult<()>
    where
        F: Fn(&Store) -> StoreResult<()>,
    {
        // No map shard stays locked while stores flush
        let stores: Vec<Arc<Store>> = self.stores.iter().map(|e| Arc::clone(e.value())).collect();
        let mut first_error = None;
        for store in stores {
            if let Err(e) = f(&store) {
                warn!("Failed to {} store {}: {}", action, store.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
