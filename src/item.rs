//! Cache item envelope
//!
//! The unit exchanged between callers, tiers and the backplane. An item is
//! identified by `(region, key)`; an absent region is its own namespace,
//! not a region named "". Items are treated as immutable once stored —
//! only `last_accessed_utc` moves, and only the manager moves it.

use std::time::{Duration, SystemTime};

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for values that can be cached.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// How an item expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationMode {
    /// Never expires.
    None,
    /// Expires a fixed duration after creation.
    Absolute,
    /// Expires a fixed duration after the last access.
    Sliding,
    /// Inherit the owning tier's expiration defaults.
    Default,
}

/// Logical identity of an item within one composed cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub key: String,
    pub region: Option<String>,
}

impl ItemKey {
    pub fn new(key: &str, region: Option<&str>) -> Self {
        Self {
            key: key.to_owned(),
            region: normalize_region(region),
        }
    }
}

/// Treat an empty region string as no region at all.
pub(crate) fn normalize_region(region: Option<&str>) -> Option<String> {
    region.filter(|r| !r.is_empty()).map(str::to_owned)
}

pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("key must not be empty".to_owned()));
    }
    Ok(())
}

pub(crate) fn validate_region(region: &str) -> Result<(), CacheError> {
    if region.is_empty() {
        return Err(CacheError::InvalidArgument("region must not be empty".to_owned()));
    }
    Ok(())
}

/// A cached value plus the metadata every tier needs to honor it.
#[derive(Debug, Clone)]
pub struct CacheItem<V> {
    pub key: String,
    pub region: Option<String>,
    pub value: V,
    pub expiration_mode: ExpirationMode,
    pub expiration_timeout: Duration,
    /// Distinguishes "explicitly no expiration" from "inherit from tier".
    pub uses_expiration_defaults: bool,
    pub created_utc: SystemTime,
    pub last_accessed_utc: SystemTime,
}

impl<V> CacheItem<V> {
    /// Create an item that inherits expiration from the tier it lands in.
    pub fn new(key: &str, value: V) -> Result<Self, CacheError> {
        validate_key(key)?;
        let now = SystemTime::now();
        Ok(Self {
            key: key.to_owned(),
            region: None,
            value,
            expiration_mode: ExpirationMode::Default,
            expiration_timeout: Duration::ZERO,
            uses_expiration_defaults: true,
            created_utc: now,
            last_accessed_utc: now,
        })
    }

    /// Create an item in a region.
    pub fn with_region(key: &str, region: &str, value: V) -> Result<Self, CacheError> {
        validate_region(region)?;
        let mut item = Self::new(key, value)?;
        item.region = normalize_region(Some(region));
        Ok(item)
    }

    /// Pin an explicit expiration on the item.
    ///
    /// Any mode other than `None` requires a positive timeout.
    pub fn with_expiration(
        mut self,
        mode: ExpirationMode,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        if mode != ExpirationMode::None && timeout.is_zero() {
            return Err(CacheError::InvalidArgument(
                "expiration timeout must be positive".to_owned(),
            ));
        }
        self.expiration_mode = mode;
        self.expiration_timeout = timeout;
        self.uses_expiration_defaults = false;
        Ok(self)
    }

    /// The `(region, key)` identity of this item.
    pub fn item_key(&self) -> ItemKey {
        ItemKey {
            key: self.key.clone(),
            region: self.region.clone(),
        }
    }

    /// Replace the payload, keeping identity and expiration settings.
    pub fn with_value(&self, value: V) -> Self
    where
        V: Clone,
    {
        let mut item = self.clone();
        item.value = value;
        item
    }

    /// Mark the item as read now. Called by the manager on a successful get.
    pub fn touch(&mut self) {
        self.last_accessed_utc = SystemTime::now();
    }

    /// Evaluate expiration against `now` using the item's own settings.
    ///
    /// Items still carrying `Default` mode never expire here; the owning
    /// tier resolves defaults before storing.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        let anchor = match self.expiration_mode {
            ExpirationMode::Absolute => self.created_utc,
            ExpirationMode::Sliding => self.last_accessed_utc,
            ExpirationMode::None | ExpirationMode::Default => return false,
        };
        match now.duration_since(anchor) {
            Ok(age) => age >= self.expiration_timeout,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            CacheItem::new("", 1u32),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(matches!(
            CacheItem::with_region("k", "", 1u32),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_timeout_with_mode_is_rejected() {
        let item = CacheItem::new("k", 1u32).unwrap();
        assert!(matches!(
            item.with_expiration(ExpirationMode::Absolute, Duration::ZERO),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn explicit_none_clears_defaults_flag() {
        let item = CacheItem::new("k", 1u32)
            .unwrap()
            .with_expiration(ExpirationMode::None, Duration::ZERO)
            .unwrap();
        assert!(!item.uses_expiration_defaults);
        assert_eq!(item.expiration_mode, ExpirationMode::None);
    }

    #[test]
    fn empty_region_key_is_absent_region() {
        assert_eq!(ItemKey::new("k", Some("")), ItemKey::new("k", None));
    }

    #[test]
    fn absolute_expiration_is_anchored_to_creation() {
        let item = CacheItem::new("k", 1u32)
            .unwrap()
            .with_expiration(ExpirationMode::Absolute, Duration::from_secs(10))
            .unwrap();
        assert!(!item.is_expired(item.created_utc + Duration::from_secs(9)));
        assert!(item.is_expired(item.created_utc + Duration::from_secs(10)));
    }

    #[test]
    fn sliding_expiration_follows_last_access() {
        let mut item = CacheItem::new("k", 1u32)
            .unwrap()
            .with_expiration(ExpirationMode::Sliding, Duration::from_secs(10))
            .unwrap();
        item.last_accessed_utc = item.created_utc + Duration::from_secs(8);
        assert!(!item.is_expired(item.created_utc + Duration::from_secs(15)));
        assert!(item.is_expired(item.created_utc + Duration::from_secs(18)));
    }
}
