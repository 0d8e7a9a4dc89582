//! Cache configuration

use std::time::Duration;

use crate::tier::ExpirationDefaults;

/// Retry behavior for broker operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Settings for one shared broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Opaque connection string, e.g. `redis://127.0.0.1:6379`. May embed
    /// `password=...`, which is redacted from log output.
    pub connection_string: String,
    /// Assume this server version instead of probing the peer.
    pub strict_compatibility_version: Option<String>,
    /// The deployment sits behind a sharding proxy; only a conservative
    /// feature set can be assumed and probing is skipped.
    pub sharding_proxy: bool,
    pub retry: RetryPolicy,
}

impl ConnectionConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            strict_compatibility_version: None,
            sharding_proxy: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Backplane tuning knobs.
#[derive(Debug, Clone)]
pub struct BackplaneConfig {
    /// Channel the invalidation frames are published on.
    pub channel: String,
    /// Upper bound on the pending invalidation set.
    pub hard_limit: usize,
    /// Safety-net flush cadence.
    pub flush_interval: Duration,
    /// Short wait before serializing so further enqueues join the batch.
    pub coalesce_delay: Duration,
    /// How long shutdown waits for the final flush.
    pub shutdown_deadline: Duration,
}

impl BackplaneConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            channel: "cache:invalidate".to_owned(),
            hard_limit: 5000,
            flush_interval: Duration::from_millis(100),
            coalesce_delay: Duration::from_millis(10),
            shutdown_deadline: Duration::from_secs(1),
        }
    }
}

/// Configuration for the in-process memory tier.
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Tier name, unique within one manager.
    pub name: String,
    /// Maximum number of entries.
    pub max_capacity: u64,
    /// Expiration applied to items that inherit from the tier.
    pub expiration: ExpirationDefaults,
    /// Whether this tier backs the backplane.
    pub backplane_source: bool,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_owned(),
            max_capacity: 10_000,
            expiration: ExpirationDefaults::none(),
            backplane_source: false,
        }
    }
}
