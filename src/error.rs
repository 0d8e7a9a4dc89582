//! Cache error types

use redis::RedisError;

/// Errors surfaced by the layered cache and its broker plumbing.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid caller input: empty key, empty region on a region variant,
    /// zero timeout with a non-`None` expiration mode.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted after the manager was shut down.
    #[error("cache manager has been shut down")]
    AlreadyDisposed,

    /// The backing broker could not be reached, or retries were exhausted.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// The peer does not understand a command we depend on. Never retried.
    #[error("incompatible peer: {0}")]
    IncompatiblePeer(String),

    #[error("broker error: {0}")]
    Broker(#[from] RedisError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl CacheError {
    /// Whether a retry of the failed operation may succeed.
    ///
    /// Only broker-level failures are ever transient; a server that answered
    /// with "unknown command" is an incompatible peer, not a flaky one.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Broker(e) => is_transient_broker_error(e),
            _ => false,
        }
    }
}

/// Classify a broker error as transient (worth retrying) or not.
///
/// Timeouts, dropped/refused connections and server-side "busy, try again"
/// responses are transient. Everything else, including an "unknown command"
/// response from an incompatible peer, propagates immediately.
pub(crate) fn is_transient_broker_error(err: &RedisError) -> bool {
    use redis::ErrorKind;

    if is_unknown_command(err) {
        return false;
    }
    if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        return true;
    }
    matches!(
        err.kind(),
        ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::MasterDown | ErrorKind::ClusterDown
    )
}

/// A server error whose message carries the "unknown command" marker comes
/// from a peer that does not speak our dialect at all.
pub(crate) fn is_unknown_command(err: &RedisError) -> bool {
    err.to_string().to_ascii_lowercase().contains("unknown command")
}
