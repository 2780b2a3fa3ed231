//! Periodic cache flushing
//!
//! Stores flush their write cache on their own when it fills up. These
//! tasks add the time threshold: they run on a `tokio` interval and call
//! the synchronous `flush` of one store or of a whole registry.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::lifecycle::StateStore;
use crate::store::{Store, StoreRegistry};

/// Flush every store of `registry` each `period`, until the task is aborted
pub fn spawn_flush_task(registry: Arc<StoreRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = registry.flush_all() {
                warn!("Periodic flush failed: {}", e);
            }
        }
    })
}

/// Flush `store` each `period` until the store is closed
pub fn spawn_store_flush_task(store: Arc<Store>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if !store.is_open() {
                debug!("Store {} closed, stopping flush task", store.name());
                break;
            }
            if let Err(e) = store.flush() {
                warn!("Periodic flush of store {} failed: {}", store.name(), e);
            }
        }
    })
}

/// Flush task for `store` following its cache configuration
///
/// `None` when the cache is disabled or has no flush interval.
pub fn spawn_configured_flush_task(config: &StoreConfig, store: Arc<Store>) -> Option<JoinHandle<()>> {
    if !config.cache.enabled {
        return None;
    }
    let period = config.cache.flush_interval()?;
    Some(spawn_store_flush_task(store, period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::InMemoryChangelog;
    use crate::config::CacheConfig;
    use crate::store::StoreBuilder;

    fn cached_config(name: &str) -> StoreConfig {
        let mut cache = CacheConfig::enabled(100);
        cache.flush_interval_ms = Some(50);
        StoreConfig::in_memory(name)
            .with_cache(cache)
            .with_changelog(true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_flush_task_flushes_and_stops() {
        let sink = Arc::new(InMemoryChangelog::new());
        let config = cached_config("cached");
        let store = Arc::new(
            StoreBuilder::new(config.clone())
                .with_changelog(sink.clone())
                .build()
                .unwrap(),
        );
        let handle = spawn_configured_flush_task(&config, Arc::clone(&store)).unwrap();

        store.as_key_value().unwrap().put(b"k", b"v").unwrap();
        assert!(sink.is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.len(), 1);

        store.close().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_flush_task() {
        let sink = Arc::new(InMemoryChangelog::new());
        let registry = Arc::new(StoreRegistry::new());
        let store = registry
            .build(StoreBuilder::new(cached_config("a")).with_changelog(sink.clone()))
            .unwrap();
        let handle = spawn_flush_task(Arc::clone(&registry), Duration::from_millis(50));

        store.as_key_value().unwrap().put(b"k", b"v").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.records_for("a").len(), 1);

        handle.abort();
    }

    #[test]
    fn test_no_task_without_interval() {
        let config = StoreConfig::in_memory("plain");
        let store = Arc::new(StoreBuilder::new(config.clone()).build().unwrap());
        assert!(spawn_configured_flush_task(&config, store).is_none());
    }
}
