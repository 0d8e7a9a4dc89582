//! Layered cache manager
//!
//! Composes an ordered list of tiers (index 0 = fastest, last = bottommost,
//! typically the shared distributed one) into one logical cache:
//!
//! - reads walk the tiers top-down and promote hits upward
//! - puts write through every tier
//! - adds go to the authoritative bottom tier only, evicting upper copies
//! - removes and clears reach every tier
//!
//! With a backplane configured, local mutations are announced to other
//! processes and foreign announcements evict the non-source tiers here, so
//! in-memory tiers stay coherent with the shared tier. The manager is safe
//! for concurrent use; operations on the same key inherit whatever ordering
//! the tiers provide.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::CacheError;
use crate::backplane::{BackplaneTransport, CacheBackplane};
use crate::config::BackplaneConfig;
use crate::events::{CacheEventListener, dispatch};
use crate::item::{CacheItem, Cacheable, validate_key, validate_region};
use crate::protocol::{BackplaneMessage, ChangeAction};
use crate::stats::{StatsSnapshot, TierStats};
use crate::tier::{CacheTier, UpdateOutcome};

struct ManagerInner<V: Cacheable> {
    name: String,
    tiers: Vec<Arc<dyn CacheTier<V>>>,
    stats: Vec<Arc<TierStats>>,
    listeners: Vec<Arc<dyn CacheEventListener>>,
    backplane: Option<CacheBackplane>,
    update_max_retries: u32,
    disposed: AtomicBool,
    inbound: Mutex<Option<JoinHandle<()>>>,
}

/// One logical cache over an ordered stack of tiers.
pub struct CacheManager<V: Cacheable> {
    inner: Arc<ManagerInner<V>>,
}

impl<V: Cacheable> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder<V: Cacheable> {
    name: String,
    tiers: Vec<Arc<dyn CacheTier<V>>>,
    listeners: Vec<Arc<dyn CacheEventListener>>,
    backplane: Option<(Arc<dyn BackplaneTransport>, BackplaneConfig)>,
    update_max_retries: u32,
}

impl<V: Cacheable> CacheManagerBuilder<V> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            tiers: Vec::new(),
            listeners: Vec::new(),
            backplane: None,
            update_max_retries: 50,
        }
    }

    /// Append a tier below the ones added so far.
    pub fn tier(mut self, tier: impl CacheTier<V> + 'static) -> Self {
        self.tiers.push(Arc::new(tier));
        self
    }

    /// Append an already-shared tier below the ones added so far.
    pub fn shared_tier(mut self, tier: Arc<dyn CacheTier<V>>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn listener(mut self, listener: impl CacheEventListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Attach a backplane; foreign invalidations will evict the non-source
    /// tiers of this manager.
    pub fn backplane(
        mut self,
        transport: Arc<dyn BackplaneTransport>,
        config: BackplaneConfig,
    ) -> Self {
        self.backplane = Some((transport, config));
        self
    }

    /// Retry budget handed to the bottom tier on `update`.
    pub fn update_max_retries(mut self, retries: u32) -> Self {
        self.update_max_retries = retries;
        self
    }

    pub async fn build(self) -> Result<CacheManager<V>, CacheError> {
        if self.tiers.is_empty() {
            return Err(CacheError::InvalidArgument(
                "a cache manager needs at least one tier".to_owned(),
            ));
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if self.tiers[..i].iter().any(|t| t.name() == tier.name()) {
                return Err(CacheError::InvalidArgument(format!(
                    "duplicate tier name {:?}",
                    tier.name()
                )));
            }
        }
        let sources = self
            .tiers
            .iter()
            .filter(|t| t.is_backplane_source())
            .count();
        if sources > 1 {
            return Err(CacheError::InvalidArgument(
                "at most one tier may be the backplane source".to_owned(),
            ));
        }

        let (engine, inbound_rx) = match self.backplane {
            Some((transport, config)) => {
                if sources == 0 {
                    warn!(
                        "cache {}: backplane configured without a source tier; \
                         remote invalidations will evict every tier",
                        self.name
                    );
                }
                let engine = CacheBackplane::new(transport, config);
                let rx = engine.start().await?;
                (Some(engine), Some(rx))
            }
            None => (None, None),
        };

        let stats = self.tiers.iter().map(|_| Arc::new(TierStats::new())).collect();
        let inner = Arc::new(ManagerInner {
            name: self.name,
            tiers: self.tiers,
            stats,
            listeners: self.listeners,
            backplane: engine,
            update_max_retries: self.update_max_retries,
            disposed: AtomicBool::new(false),
            inbound: Mutex::new(None),
        });

        if let Some(rx) = inbound_rx {
            let task = tokio::spawn(inbound_loop(Arc::clone(&inner), rx));
            *inner.inbound.lock() = Some(task);
        }

        Ok(CacheManager { inner })
    }
}

impl<V: Cacheable> CacheManager<V> {
    pub fn builder(name: &str) -> CacheManagerBuilder<V> {
        CacheManagerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn tier_count(&self) -> usize {
        self.inner.tiers.len()
    }

    /// Per-tier counter snapshots, topmost first.
    pub fn statistics(&self) -> Vec<(String, StatsSnapshot)> {
        self.inner
            .tiers
            .iter()
            .zip(&self.inner.stats)
            .map(|(tier, stats)| (tier.name().to_owned(), stats.snapshot()))
            .collect()
    }

    pub fn tier_statistics(&self, tier_name: &str) -> Option<StatsSnapshot> {
        self.inner
            .tiers
            .iter()
            .position(|t| t.name() == tier_name)
            .map(|i| self.inner.stats[i].snapshot())
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CacheError::AlreadyDisposed);
        }
        Ok(())
    }

    fn check_region(region: Option<&str>) -> Result<(), CacheError> {
        if let Some(region) = region {
            validate_region(region)?;
        }
        Ok(())
    }

    /// Write-once across the composed cache.
    ///
    /// The item is added to the bottommost (authoritative) tier only; on
    /// success every upper tier is evicted so stale copies cannot shadow
    /// it. Returns false when a live item already exists.
    pub async fn add(&self, item: CacheItem<V>) -> Result<bool, CacheError> {
        self.ensure_live()?;
        validate_key(&item.key)?;
        let key = item.key.clone();
        let region = item.region.clone();

        let bottom = self.inner.tiers.len() - 1;
        self.inner.stats[bottom].record_add();
        if !self.inner.tiers[bottom].add(item).await? {
            return Ok(false);
        }
        self.inner.stats[bottom].item_added();

        for i in 0..bottom {
            if self.inner.tiers[i].remove(&key, region.as_deref()).await? {
                self.inner.stats[i].item_removed();
            }
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_change(&key, region.as_deref(), ChangeAction::Add);
        }
        dispatch(&self.inner.listeners, "add", |l| {
            l.on_add(&key, region.as_deref())
        });
        Ok(true)
    }

    /// Write-through: the item is stored in every tier, top to bottom.
    pub async fn put(&self, item: CacheItem<V>) -> Result<(), CacheError> {
        self.ensure_live()?;
        validate_key(&item.key)?;
        let key = item.key.clone();
        let region = item.region.clone();

        for (tier, stats) in self.inner.tiers.iter().zip(&self.inner.stats) {
            // Targeted pre-read so the item count distinguishes insert
            // from overwrite.
            let existed = tier.exists(&key, region.as_deref()).await?;
            stats.record_put();
            if !existed {
                stats.item_added();
            }
            tier.put(item.clone()).await?;
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_change(&key, region.as_deref(), ChangeAction::Put);
        }
        dispatch(&self.inner.listeners, "put", |l| {
            l.on_put(&key, region.as_deref())
        });
        Ok(())
    }

    /// Read-through with promotion: tiers are consulted top-down and a hit
    /// is copied into the faster tiers above it.
    pub async fn get(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CacheItem<V>>, CacheError> {
        self.ensure_live()?;
        validate_key(key)?;
        Self::check_region(region)?;

        for i in 0..self.inner.tiers.len() {
            match self.inner.tiers[i].get(key, region).await? {
                None => self.inner.stats[i].record_miss(),
                Some(mut item) => {
                    self.inner.stats[i].record_hit();
                    item.touch();
                    self.promote(&item, i).await?;
                    dispatch(&self.inner.listeners, "get", |l| l.on_get(key, region));
                    return Ok(Some(item));
                }
            }
        }
        Ok(None)
    }

    /// Overwrite the item into every tier above the one that returned it,
    /// stopping at a backplane source.
    async fn promote(&self, item: &CacheItem<V>, found_at: usize) -> Result<(), CacheError> {
        for i in 0..found_at {
            let tier = &self.inner.tiers[i];
            if tier.is_backplane_source() {
                break;
            }
            let existed = tier.exists(&item.key, item.region.as_deref()).await?;
            tier.put(item.clone()).await?;
            if !existed {
                self.inner.stats[i].item_added();
            }
            debug!(
                "cache {}: promoted {} into tier {}",
                self.inner.name,
                item.key,
                tier.name()
            );
        }
        Ok(())
    }

    /// Remove from every tier. Returns true when any tier held the item.
    pub async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError> {
        self.ensure_live()?;
        validate_key(key)?;
        Self::check_region(region)?;

        let mut removed_any = false;
        for (tier, stats) in self.inner.tiers.iter().zip(&self.inner.stats) {
            stats.record_remove();
            if tier.remove(key, region).await? {
                stats.item_removed();
                removed_any = true;
            }
        }

        if removed_any {
            if let Some(backplane) = &self.inner.backplane {
                backplane.notify_remove(key, region);
            }
            dispatch(&self.inner.listeners, "remove", |l| l.on_remove(key, region));
        }
        Ok(removed_any)
    }

    /// Read-modify-write against the authoritative bottom tier.
    ///
    /// On success all other tiers are evicted so the next read refetches
    /// the new version. `Exhausted` means the tier's retry budget ran out;
    /// nothing above the bottom tier was touched.
    pub async fn update<F>(
        &self,
        key: &str,
        region: Option<&str>,
        factory: F,
    ) -> Result<UpdateOutcome<V>, CacheError>
    where
        F: Fn(&V) -> V + Send + Sync,
    {
        self.ensure_live()?;
        validate_key(key)?;
        Self::check_region(region)?;

        let bottom = self.inner.tiers.len() - 1;
        let outcome = self.inner.tiers[bottom]
            .update(key, region, &factory, self.inner.update_max_retries)
            .await?;

        if outcome.is_updated() {
            for i in 0..bottom {
                if self.inner.tiers[i].remove(key, region).await? {
                    self.inner.stats[i].item_removed();
                }
            }
            if let Some(backplane) = &self.inner.backplane {
                backplane.notify_change(key, region, ChangeAction::Update);
            }
            dispatch(&self.inner.listeners, "update", |l| l.on_update(key, region));
        }
        Ok(outcome)
    }

    /// Clear every tier and reset its statistics.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_live()?;

        for (tier, stats) in self.inner.tiers.iter().zip(&self.inner.stats) {
            tier.clear().await?;
            stats.reset();
            stats.record_clear();
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_clear();
        }
        dispatch(&self.inner.listeners, "clear", |l| l.on_clear());
        Ok(())
    }

    /// Clear one region on every tier and reset tier statistics.
    pub async fn clear_region(&self, region: &str) -> Result<(), CacheError> {
        self.ensure_live()?;
        validate_region(region)?;

        for (tier, stats) in self.inner.tiers.iter().zip(&self.inner.stats) {
            tier.clear_region(region).await?;
            stats.reset();
            stats.record_clear_region();
        }

        if let Some(backplane) = &self.inner.backplane {
            backplane.notify_clear_region(region);
        }
        dispatch(&self.inner.listeners, "clear_region", |l| {
            l.on_clear_region(region)
        });
        Ok(())
    }

    /// Shut the manager down: flush and stop the backplane, then close the
    /// owned tiers bottom-up. Further calls fail with `AlreadyDisposed`.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(backplane) = &self.inner.backplane {
            backplane.shutdown().await;
        }
        if let Some(task) = self.inner.inbound.lock().take() {
            task.abort();
        }
        for tier in self.inner.tiers.iter().rev() {
            tier.close().await;
        }
    }
}

/// Apply foreign backplane messages in delivery order. Self-echoes never
/// reach this point.
async fn inbound_loop<V: Cacheable>(
    inner: Arc<ManagerInner<V>>,
    mut rx: mpsc::UnboundedReceiver<BackplaneMessage>,
) {
    while let Some(message) = rx.recv().await {
        apply_remote(&inner, message).await;
    }
}

async fn apply_remote<V: Cacheable>(inner: &ManagerInner<V>, message: BackplaneMessage) {
    match message {
        BackplaneMessage::Changed { key, region, .. }
        | BackplaneMessage::Removed { key, region, .. } => {
            for (tier, stats) in inner.tiers.iter().zip(&inner.stats) {
                if tier.is_backplane_source() {
                    continue;
                }
                match tier.remove(&key, region.as_deref()).await {
                    Ok(true) => stats.item_removed(),
                    Ok(false) => {}
                    Err(e) => warn!(
                        "cache {}: remote eviction of {:?} failed on tier {}: {}",
                        inner.name,
                        key,
                        tier.name(),
                        e
                    ),
                }
            }
        }
        BackplaneMessage::Clear { .. } => {
            for (tier, stats) in inner.tiers.iter().zip(&inner.stats) {
                if tier.is_backplane_source() {
                    continue;
                }
                match tier.clear().await {
                    Ok(()) => stats.reset(),
                    Err(e) => warn!(
                        "cache {}: remote clear failed on tier {}: {}",
                        inner.name,
                        tier.name(),
                        e
                    ),
                }
            }
        }
        BackplaneMessage::ClearRegion { region, .. } => {
            for (tier, stats) in inner.tiers.iter().zip(&inner.stats) {
                if tier.is_backplane_source() {
                    continue;
                }
                match tier.clear_region(&region).await {
                    Ok(()) => stats.reset(),
                    Err(e) => warn!(
                        "cache {}: remote clear of region {:?} failed on tier {}: {}",
                        inner.name,
                        region,
                        tier.name(),
                        e
                    ),
                }
            }
        }
    }
}
