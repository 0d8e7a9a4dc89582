//! The contract a cache tier must satisfy
//!
//! A tier is one layer of the composed cache. The manager owns an ordered
//! list of them, index 0 being the fastest. Tiers never talk to each other
//! and never touch the backplane; the manager coordinates both.

use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;
use crate::item::{CacheItem, Cacheable, ExpirationMode};

/// Expiration applied to items stored with `ExpirationMode::Default`.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationDefaults {
    pub mode: ExpirationMode,
    pub timeout: Duration,
}

impl ExpirationDefaults {
    /// No default expiration: inherited items live forever.
    pub fn none() -> Self {
        Self {
            mode: ExpirationMode::None,
            timeout: Duration::ZERO,
        }
    }

    pub fn absolute(timeout: Duration) -> Self {
        Self {
            mode: ExpirationMode::Absolute,
            timeout,
        }
    }

    pub fn sliding(timeout: Duration) -> Self {
        Self {
            mode: ExpirationMode::Sliding,
            timeout,
        }
    }
}

/// Outcome of a read-modify-write against a single tier.
#[derive(Debug, Clone)]
pub enum UpdateOutcome<V> {
    /// The factory output was stored; carries the stored item.
    Updated(CacheItem<V>),
    /// No live item exists for the key.
    Missing,
    /// Concurrent writers won every round and retries ran out.
    Exhausted,
}

impl<V> UpdateOutcome<V> {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// One layer of the composed cache.
///
/// Implementations evaluate expiration on read: an expired item is purged
/// and reported absent. `get` must not move `last_accessed_utc` on the
/// returned item; the manager does that on successful reads.
#[async_trait]
pub trait CacheTier<V: Cacheable>: Send + Sync {
    /// Tier name, unique within one manager.
    fn name(&self) -> &str;

    /// Whether this tier backs the backplane. At most one tier per manager,
    /// by convention the bottommost. Backplane echoes never mutate it.
    fn is_backplane_source(&self) -> bool {
        false
    }

    /// Whether the tier is shared across processes.
    fn is_distributed(&self) -> bool {
        false
    }

    /// Expiration applied to items that inherit from the tier.
    fn expiration_defaults(&self) -> ExpirationDefaults {
        ExpirationDefaults::none()
    }

    /// Store the item only if no live item exists for `(region, key)`.
    /// Returns false on conflict without touching the stored item.
    async fn add(&self, item: CacheItem<V>) -> Result<bool, CacheError>;

    /// Unconditional insert or overwrite.
    async fn put(&self, item: CacheItem<V>) -> Result<(), CacheError>;

    async fn get(
        &self,
        key: &str,
        region: Option<&str>,
    ) -> Result<Option<CacheItem<V>>, CacheError>;

    async fn exists(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError>;

    /// Returns true iff an item was removed.
    async fn remove(&self, key: &str, region: Option<&str>) -> Result<bool, CacheError>;

    /// Read-modify-write with retry against the tier's own concurrency
    /// primitives. The factory must be a pure function of the current value.
    async fn update(
        &self,
        key: &str,
        region: Option<&str>,
        factory: &(dyn for<'a> Fn(&'a V) -> V + Send + Sync),
        max_retries: u32,
    ) -> Result<UpdateOutcome<V>, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn clear_region(&self, region: &str) -> Result<(), CacheError>;

    /// Number of live items. May be approximate for tiers that evict lazily.
    async fn len(&self) -> u64;

    /// Release tier resources. The manager calls this on shutdown.
    async fn close(&self) {}
}
