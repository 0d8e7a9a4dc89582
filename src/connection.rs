//! Shared broker connections
//!
//! Process-wide pool of multiplexed Redis connections keyed by connection
//! string, shared by every manager in the process. Connections are created
//! on first use, retained until explicitly removed, and reconnect
//! internally when the broker drops them. A retry wrapper absorbs
//! transient broker faults; feature probing reports what the connected
//! peer can do.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::CacheError;
use crate::config::{ConnectionConfig, RetryPolicy};
use crate::error::is_unknown_command;

/// Caller-supplied dialer, overriding the default connection setup.
pub type ConnectionFactory = Arc<
    dyn Fn(ConnectionConfig) -> BoxFuture<'static, Result<ConnectionManager, CacheError>>
        + Send
        + Sync,
>;

static CONNECTIONS: OnceLock<RwLock<HashMap<String, ConnectionManager>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, ConnectionManager>> {
    CONNECTIONS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Return the shared connection for the config's connection string,
/// establishing and health-checking it on first use.
///
/// Fails with `BackingStoreUnavailable` when no healthy connection can be
/// established.
pub async fn connect(config: &ConnectionConfig) -> Result<ConnectionManager, CacheError> {
    connect_with(config, None).await
}

/// Like [`connect`], with an optional dialer override.
pub async fn connect_with(
    config: &ConnectionConfig,
    factory: Option<&ConnectionFactory>,
) -> Result<ConnectionManager, CacheError> {
    get_or_add(registry(), &config.connection_string, || async move {
        match factory {
            Some(dial) => dial(config.clone()).await,
            None => establish(config).await,
        }
    })
    .await
}

/// Drop the shared connection for a connection string, if any. The next
/// [`connect`] re-establishes it.
pub async fn remove_connection(connection_string: &str) {
    if let Some(map) = CONNECTIONS.get() {
        map.write().await.remove(connection_string);
    }
}

/// Concurrent get-or-add: the create closure runs at most once per key,
/// even under contention.
async fn get_or_add<T, F, Fut>(
    map: &RwLock<HashMap<String, T>>,
    key: &str,
    create: F,
) -> Result<T, CacheError>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    {
        let entries = map.read().await;
        if let Some(existing) = entries.get(key) {
            return Ok(existing.clone());
        }
    }

    let mut entries = map.write().await;
    // Double-check: another task may have created the entry while we
    // waited for the write lock.
    if let Some(existing) = entries.get(key) {
        return Ok(existing.clone());
    }
    let created = create().await?;
    entries.insert(key.to_owned(), created.clone());
    Ok(created)
}

async fn establish(config: &ConnectionConfig) -> Result<ConnectionManager, CacheError> {
    let redacted = redact_connection_string(&config.connection_string);
    debug!("establishing shared broker connection to {}", redacted);

    let client = redis::Client::open(config.connection_string.as_str()).map_err(|e| {
        CacheError::BackingStoreUnavailable(format!("invalid connection string {redacted}: {e}"))
    })?;
    let mut connection = ConnectionManager::new(client).await.map_err(|e| {
        CacheError::BackingStoreUnavailable(format!("cannot connect to {redacted}: {e}"))
    })?;

    match redis::cmd("PING").query_async::<String>(&mut connection).await {
        Ok(_) => Ok(connection),
        Err(e) => Err(CacheError::BackingStoreUnavailable(format!(
            "{redacted} failed health check: {e}"
        ))),
    }
}

/// Execute `op`, retrying transient broker errors with a fixed backoff.
///
/// Non-transient errors propagate immediately; an "unknown command"
/// response surfaces as `IncompatiblePeer` and is never retried. When all
/// attempts fail transiently, the last error is elevated to
/// `BackingStoreUnavailable`.
pub async fn retry<T, F, Fut>(op: F, policy: RetryPolicy) -> Result<T, CacheError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<CacheError> = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if let CacheError::Broker(e) = &error {
                    if is_unknown_command(e) {
                        return Err(CacheError::IncompatiblePeer(error.to_string()));
                    }
                }
                if !error.is_transient() {
                    return Err(error);
                }
                warn!(
                    "transient broker error on attempt {}/{}: {}",
                    attempt, attempts, error
                );
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    let detail = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no error recorded".to_owned());
    Err(CacheError::BackingStoreUnavailable(format!(
        "{attempts} attempts exhausted: {detail}"
    )))
}

/// Capabilities of the connected broker peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFeatures {
    pub version: (u32, u32, u32),
    /// Non-blocking delete (UNLINK), 4.0 and up.
    pub supports_unlink: bool,
    /// Multi-key commands reach a single keyspace. False behind a
    /// sharding proxy.
    pub supports_multi_key: bool,
}

impl ServerFeatures {
    fn for_version(version: (u32, u32, u32)) -> Self {
        Self {
            version,
            supports_unlink: version.0 >= 4,
            supports_multi_key: true,
        }
    }

    /// What can safely be assumed of an unknown peer behind a proxy.
    fn conservative() -> Self {
        Self {
            version: (2, 6, 0),
            supports_unlink: false,
            supports_multi_key: false,
        }
    }
}

/// Report the feature set of the configured peer.
///
/// With `strict_compatibility_version` set, the declared version is trusted
/// without probing. Behind a sharding proxy only the conservative set is
/// assumed. Otherwise the first connected endpoint is probed.
pub async fn server_features(config: &ConnectionConfig) -> Result<ServerFeatures, CacheError> {
    if let Some(declared) = &config.strict_compatibility_version {
        return Ok(ServerFeatures::for_version(parse_version(declared)?));
    }
    if config.sharding_proxy {
        return Ok(ServerFeatures::conservative());
    }

    let connection = connect(config).await?;
    let info: String = retry(
        || {
            let mut conn = connection.clone();
            async move {
                redis::cmd("INFO")
                    .arg("server")
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(CacheError::from)
            }
        },
        config.retry,
    )
    .await?;

    let version = info
        .lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .ok_or_else(|| {
            CacheError::BackingStoreUnavailable("no connected server reported a version".to_owned())
        })?;
    Ok(ServerFeatures::for_version(parse_version(version)?))
}

fn parse_version(raw: &str) -> Result<(u32, u32, u32), CacheError> {
    let mut parts = raw.trim().split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| CacheError::InvalidArgument(format!("unparseable server version {raw:?}")))?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major, minor, patch))
}

/// Redact any `password=...` fragment (case-insensitive, up to the next
/// `,`) so connection strings are safe to log.
pub fn redact_connection_string(input: &str) -> String {
    const MARKER: &str = "password=";

    let lower = input.to_ascii_lowercase();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while let Some(found) = lower[pos..].find(MARKER) {
        let value_start = pos + found + MARKER.len();
        let value_end = input[value_start..]
            .find(',')
            .map(|i| value_start + i)
            .unwrap_or(input.len());
        out.push_str(&input[pos..value_start]);
        out.push_str("*****");
        pos = value_end;
    }
    out.push_str(&input[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    fn transient_error() -> CacheError {
        CacheError::Broker(redis::RedisError::from((
            redis::ErrorKind::TryAgain,
            "try again later",
        )))
    }

    fn fatal_error() -> CacheError {
        CacheError::Broker(redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "wrong type",
        )))
    }

    fn unknown_command_error() -> CacheError {
        CacheError::Broker(redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "server response",
            "ERR unknown command 'UNLINK'".to_owned(),
        )))
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = retry(
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient_error())
                } else {
                    Ok(7u32)
                }
            },
            fast_retry(5),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_elevates_to_unavailable() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, _> = retry(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient_error())
            },
            fast_retry(3),
        )
        .await;
        assert!(matches!(result, Err(CacheError::BackingStoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_propagates_fatal_errors_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, _> = retry(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(fatal_error())
            },
            fast_retry(5),
        )
        .await;
        assert!(matches!(result, Err(CacheError::Broker(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_an_incompatible_peer() {
        let result: Result<u32, _> =
            retry(|| async { Err(unknown_command_error()) }, fast_retry(5)).await;
        assert!(matches!(result, Err(CacheError::IncompatiblePeer(_))));
    }

    #[tokio::test]
    async fn get_or_add_runs_create_once_per_key() {
        let map = Arc::new(RwLock::new(HashMap::<String, u32>::new()));
        let creates = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            let creates = Arc::clone(&creates);
            handles.push(tokio::spawn(async move {
                get_or_add(&map, "conn", || async move {
                    creates.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(42u32)
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strict_compatibility_skips_probing() {
        let mut config = ConnectionConfig::new("redis://unreachable:1");
        config.strict_compatibility_version = Some("4.0.11".to_owned());
        let features = server_features(&config).await.unwrap();
        assert_eq!(features.version, (4, 0, 11));
        assert!(features.supports_unlink);
        assert!(features.supports_multi_key);
    }

    #[tokio::test]
    async fn sharding_proxy_gets_conservative_features() {
        let mut config = ConnectionConfig::new("redis://unreachable:1");
        config.sharding_proxy = true;
        let features = server_features(&config).await.unwrap();
        assert!(!features.supports_unlink);
        assert!(!features.supports_multi_key);
    }

    #[test]
    fn versions_parse_leniently() {
        assert_eq!(parse_version("7.2").unwrap(), (7, 2, 0));
        assert_eq!(parse_version(" 3.0.504 ").unwrap(), (3, 0, 504));
        assert!(parse_version("latest").is_err());
    }

    #[test]
    fn passwords_are_redacted_from_connection_strings() {
        assert_eq!(
            redact_connection_string("host:6379,password=s3cret,ssl=true"),
            "host:6379,password=*****,ssl=true"
        );
        assert_eq!(
            redact_connection_string("host:6379,Password=s3cret"),
            "host:6379,Password=*****"
        );
        assert_eq!(
            redact_connection_string("host:6379,PASSWORD=a,password=b"),
            "host:6379,PASSWORD=*****,password=*****"
        );
        assert_eq!(redact_connection_string("host:6379"), "host:6379");
    }
}
