//! cachemesh - layered cache coordination
//!
//! This library composes a stack of cache tiers into one logical cache:
//! - Ordered tiers: in-memory on top, a shared distributed one at the bottom
//! - Read-through with promotion into faster tiers
//! - Write-through puts, write-once adds, bottom-authoritative updates
//! - Cross-process invalidation via a batched pub/sub backplane (Redis)
//! - Process-wide shared broker connections with retry on transient faults
//! - Per-tier statistics and observer events
//!
//! Concrete distributed tiers plug in through the [`CacheTier`] contract;
//! an in-process moka tier ships with the crate.

mod backplane;
mod blocking;
mod config;
mod connection;
mod error;
mod events;
mod item;
mod manager;
mod memory;
mod protocol;
mod stats;
mod tier;

pub use backplane::{
    BackplaneTransport, CacheBackplane, FrameHandler, LoopbackTransport, RedisTransport,
};
pub use blocking::BlockingCacheManager;
pub use config::{BackplaneConfig, ConnectionConfig, MemoryTierConfig, RetryPolicy};
pub use connection::{
    ConnectionFactory, ServerFeatures, connect, connect_with, redact_connection_string,
    remove_connection, retry, server_features,
};
pub use error::CacheError;
pub use events::{CacheEventListener, ListenerError};
pub use item::{CacheItem, Cacheable, ExpirationMode, ItemKey};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use memory::MemoryTier;
pub use protocol::{BackplaneMessage, ChangeAction, decode_frame, encode_frame};
pub use stats::{StatsSnapshot, TierStats};
pub use tier::{CacheTier, ExpirationDefaults, UpdateOutcome};

// Re-export async_trait for tier and transport implementations.
pub use async_trait::async_trait;
