//! Blocking facade
//!
//! Synchronous entry points over the async manager: one logical operation,
//! two surfaces. The wrapper owns a small dedicated runtime so backplane
//! and tier background tasks keep running between calls; every method is a
//! blocking wait with the same semantics as its async counterpart.

use std::future::Future;

use crate::CacheError;
use crate::item::{CacheItem, Cacheable};
use crate::manager::CacheManager;
use crate::stats::StatsSnapshot;
use crate::tier::UpdateOutcome;

/// Synchronous wrapper around [`CacheManager`].
///
/// Must be created and used outside of an async runtime.
pub struct BlockingCacheManager<V: Cacheable> {
    runtime: tokio::runtime::Runtime,
    manager: CacheManager<V>,
}

impl<V: Cacheable> BlockingCacheManager<V> {
    /// Build the async manager on the wrapper's own runtime.
    pub fn new<F, Fut>(build: F) -> Result<Self, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheManager<V>, CacheError>>,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(|e| {
                CacheError::BackingStoreUnavailable(format!("cannot start cache runtime: {e}"))
            })?;
        let manager = runtime.block_on(build())?;
        Ok(Self { runtime, manager })
    }

    pub fn add(&self, item: CacheItem<V>) -> Result<bool, CacheError> {
        self.runtime.block_on(self.manager.add(item))
    }

    pub fn put(&self, item: CacheItem<V>) -> Result<(), CacheError> {
        self.runtime.block_on(self.manager.put(item))
    }

    pub fn get(&self, key: &str, region: Option<&str>) -> Result<Option<CacheItem<V>>, CacheError> {
        self.runtime.block_on(self.manager.get(key, region))
    }

    pub fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        self.runtime.block_on(self.manager.remove(key, region))
    }

    pub fn update<F>(
        &self,
        key: &str,
        region: Option<&str>,
        factory: F,
    ) -> Result<UpdateOutcome<V>, CacheError>
    where
        F: Fn(&V) -> V + Send + Sync,
    {
        self.runtime.block_on(self.manager.update(key, region, factory))
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.runtime.block_on(self.manager.clear())
    }

    pub fn clear_region(&self, region: &str) -> Result<(), CacheError> {
        self.runtime.block_on(self.manager.clear_region(region))
    }

    pub fn statistics(&self) -> Vec<(String, StatsSnapshot)> {
        self.manager.statistics()
    }

    /// Shut the wrapped manager down. The runtime stays alive until the
    /// wrapper is dropped.
    pub fn shutdown(&self) {
        self.runtime.block_on(self.manager.shutdown());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryTierConfig;
    use crate::memory::MemoryTier;

    fn blocking_cache() -> BlockingCacheManager<String> {
        BlockingCacheManager::new(|| async {
            CacheManager::builder("blocking")
                .tier(MemoryTier::new(MemoryTierConfig::default()))
                .build()
                .await
        })
        .unwrap()
    }

    #[test]
    fn blocking_surface_mirrors_the_async_one() {
        let cache = blocking_cache();

        let item = CacheItem::new("k", "v".to_owned()).unwrap();
        cache.put(item).unwrap();
        assert_eq!(cache.get("k", None).unwrap().unwrap().value, "v");

        let outcome = cache
            .update("k", None, |v: &String| format!("{v}2"))
            .unwrap();
        assert!(outcome.is_updated());
        assert_eq!(cache.get("k", None).unwrap().unwrap().value, "v2");

        assert!(cache.remove("k", None).unwrap());
        assert!(cache.get("k", None).unwrap().is_none());

        cache.shutdown();
        assert!(matches!(
            cache.get("k", None),
            Err(CacheError::AlreadyDisposed)
        ));
    }
}
