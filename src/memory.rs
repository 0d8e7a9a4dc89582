//! In-process memory tier
//!
//! Moka-backed implementation of the tier contract, usually the topmost
//! layer of a composed cache. Expiration is enforced natively by the moka
//! cache through a per-entry policy: absolute items keep their original
//! deadline (anchored to `created_utc`, so a promoted item does not get a
//! fresh lease), sliding items get a new lease on every read.

use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tracing::warn;

use crate::CacheError;
use crate::config::MemoryTierConfig;
use crate::item::{CacheItem, Cacheable, ExpirationMode, ItemKey};
use crate::tier::{CacheTier, ExpirationDefaults, UpdateOutcome};

/// Per-entry expiration policy driven by the stored item's own settings.
struct ItemExpiry;

impl ItemExpiry {
    fn lease<V>(item: &CacheItem<V>) -> Option<Duration> {
        match item.expiration_mode {
            ExpirationMode::Absolute => {
                let elapsed = SystemTime::now()
                    .duration_since(item.created_utc)
                    .unwrap_or_default();
                Some(item.expiration_timeout.saturating_sub(elapsed))
            }
            ExpirationMode::Sliding => Some(item.expiration_timeout),
            ExpirationMode::None | ExpirationMode::Default => None,
        }
    }
}

impl<V: Cacheable> Expiry<ItemKey, CacheItem<V>> for ItemExpiry {
    fn expire_after_create(
        &self,
        _key: &ItemKey,
        value: &CacheItem<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Self::lease(value)
    }

    fn expire_after_read(
        &self,
        _key: &ItemKey,
        value: &CacheItem<V>,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        match value.expiration_mode {
            ExpirationMode::Sliding => Some(value.expiration_timeout),
            _ => duration_until_expiry,
        }
    }

    fn expire_after_update(
        &self,
        _key: &ItemKey,
        value: &CacheItem<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Self::lease(value)
    }
}

/// In-process cache tier.
pub struct MemoryTier<V: Cacheable> {
    config: MemoryTierConfig,
    items: Cache<ItemKey, CacheItem<V>>,
}

impl<V: Cacheable> MemoryTier<V> {
    pub fn new(config: MemoryTierConfig) -> Self {
        let items = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(ItemExpiry)
            .support_invalidation_closures()
            .build();
        Self { config, items }
    }

    /// Items inheriting expiration get the tier defaults stamped in before
    /// storage, so the expiry policy only ever sees resolved modes.
    fn resolve_expiration(&self, mut item: CacheItem<V>) -> CacheItem<V> {
        if item.uses_expiration_defaults || item.expiration_mode == ExpirationMode::Default {
            let defaults = self.config.expiration;
            item.expiration_mode = defaults.mode;
            item.expiration_timeout = defaults.timeout;
        }
        item
    }
}

#[async_trait]
impl<V: Cacheable> CacheTier<V> for MemoryTier<V> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_backplane_source(&self) -> bool {
        self.config.backplane_source
    }

    fn expiration_defaults(&self) -> ExpirationDefaults {
        self.config.expiration
    }

    async fn add(&self, item: CacheItem<V>) -> Result<bool, CacheError> {
        let item = self.resolve_expiration(item);
        let entry = self
            .items
            .entry(item.item_key())
            .or_insert_with(async { item })
            .await;
        Ok(entry.is_fresh())
    }

    async fn put(&self, item: CacheItem<V>) -> Result<(), CacheError> {
        let item = self.resolve_expiration(item);
        self.items.insert(item.item_key(), item).await;
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CacheItem<V>>, CacheError> {
        Ok(self.items.get(&ItemKey::new(key, region)).await)
    }

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        Ok(self.items.contains_key(&ItemKey::new(key, region)))
    }

    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        Ok(self.items.remove(&ItemKey::new(key, region)).await.is_some())
    }

    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        factory: &(dyn for<'a> Fn(&'a V) -> V + Send + Sync),
        _max_retries: u32,
    ) -> Result<UpdateOutcome<V>, CacheError> {
        // The entry compute API performs the read-modify-write atomically
        // per key, so no retry loop is needed here.
        let result = self
            .items
            .entry(ItemKey::new(key, region))
            .and_compute_with(|current| {
                let next = current.map(|entry| {
                    let stored = entry.into_value();
                    let new_value = factory(&stored.value);
                    stored.with_value(new_value)
                });
                async move {
                    match next {
                        Some(item) => Op::Put(item),
                        None => Op::Nop,
                    }
                }
            })
            .await;

        match result {
            CompResult::ReplacedWith(entry) | CompResult::Inserted(entry) => {
                Ok(UpdateOutcome::Updated(entry.into_value()))
            }
            _ => Ok(UpdateOutcome::Missing),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.items.invalidate_all();
        Ok(())
    }

    async fn clear_region(&self, region: &str) -> Result<(), CacheError> {
        let region = region.to_owned();
        if let Err(e) = self
            .items
            .invalidate_entries_if(move |key, _| key.region.as_deref() == Some(region.as_str()))
        {
            warn!("memory tier {} cannot clear region: {}", self.config.name, e);
        }
        Ok(())
    }

    async fn len(&self) -> u64 {
        self.items.run_pending_tasks().await;
        self.items.entry_count()
    }

    async fn close(&self) {
        self.items.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> MemoryTier<String> {
        MemoryTier::new(MemoryTierConfig::default())
    }

    fn item(key: &str, value: &str) -> CacheItem<String> {
        CacheItem::new(key, value.to_owned()).unwrap()
    }

    #[tokio::test]
    async fn add_is_idempotent_false_and_keeps_first_value() {
        let tier = tier();
        assert!(tier.add(item("k", "v1")).await.unwrap());
        assert!(!tier.add(item("k", "v2")).await.unwrap());

        let stored = tier.get("k", None).await.unwrap().unwrap();
        assert_eq!(stored.value, "v1");
    }

    #[tokio::test]
    async fn put_overwrites() {
        let tier = tier();
        tier.put(item("k", "v1")).await.unwrap();
        tier.put(item("k", "v2")).await.unwrap();
        assert_eq!(tier.get("k", None).await.unwrap().unwrap().value, "v2");
    }

    #[tokio::test]
    async fn regions_are_distinct_namespaces() {
        let tier = tier();
        tier.put(item("k", "plain")).await.unwrap();
        tier.put(CacheItem::with_region("k", "r", "scoped".to_owned()).unwrap())
            .await
            .unwrap();

        assert_eq!(tier.get("k", None).await.unwrap().unwrap().value, "plain");
        assert_eq!(tier.get("k", Some("r")).await.unwrap().unwrap().value, "scoped");

        assert!(tier.remove("k", Some("r")).await.unwrap());
        assert!(tier.get("k", Some("r")).await.unwrap().is_none());
        assert!(tier.get("k", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_applies_factory_to_current_value() {
        let tier = tier();
        tier.put(item("k", "ab")).await.unwrap();

        let outcome = tier
            .update("k", None, &|v: &String| format!("{v}c"), 3)
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Updated(updated) => assert_eq!(updated.value, "abc"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(tier.get("k", None).await.unwrap().unwrap().value, "abc");
    }

    #[tokio::test]
    async fn update_of_missing_key_reports_missing() {
        let tier = tier();
        let outcome = tier
            .update("nope", None, &|v: &String| v.clone(), 3)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Missing));
    }

    #[tokio::test]
    async fn clear_region_leaves_other_namespaces_alone() {
        let tier = tier();
        tier.put(item("a", "1")).await.unwrap();
        tier.put(CacheItem::with_region("b", "r", "2".to_owned()).unwrap())
            .await
            .unwrap();
        tier.put(CacheItem::with_region("c", "r", "3".to_owned()).unwrap())
            .await
            .unwrap();

        tier.clear_region("r").await.unwrap();

        assert!(tier.get("b", Some("r")).await.unwrap().is_none());
        assert!(tier.get("c", Some("r")).await.unwrap().is_none());
        assert!(tier.get("a", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn absolute_expiration_removes_items() {
        let tier = tier();
        let expiring = item("k", "v")
            .with_expiration(ExpirationMode::Absolute, Duration::from_millis(50))
            .unwrap();
        tier.put(expiring).await.unwrap();

        assert!(tier.get("k", None).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(tier.get("k", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tier_defaults_apply_to_inheriting_items() {
        let tier = MemoryTier::new(MemoryTierConfig {
            expiration: ExpirationDefaults::absolute(Duration::from_millis(50)),
            ..MemoryTierConfig::default()
        });
        tier.put(item("k", "v")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(tier.get("k", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_none_overrides_tier_defaults() {
        let tier = MemoryTier::new(MemoryTierConfig {
            expiration: ExpirationDefaults::absolute(Duration::from_millis(50)),
            ..MemoryTierConfig::default()
        });
        let forever = item("k", "v")
            .with_expiration(ExpirationMode::None, Duration::ZERO)
            .unwrap();
        tier.put(forever).await.unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(tier.get("k", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sliding_expiration_extends_on_read() {
        let tier = tier();
        let sliding = item("k", "v")
            .with_expiration(ExpirationMode::Sliding, Duration::from_millis(80))
            .unwrap();
        tier.put(sliding).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(tier.get("k", None).await.unwrap().is_some());
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(tier.get("k", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn len_counts_live_items() {
        let tier = tier();
        tier.put(item("a", "1")).await.unwrap();
        tier.put(item("b", "2")).await.unwrap();
        assert_eq!(tier.len().await, 2);

        tier.clear().await.unwrap();
        assert_eq!(tier.len().await, 0);
    }
}
