//! Cache event listeners
//!
//! Observers registered with a manager are notified synchronously, once per
//! high-level operation regardless of tier count. A failing listener is
//! logged and never affects the operation that triggered it.

use std::sync::Arc;

use tracing::warn;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer for manager-level cache operations.
///
/// Every method defaults to a no-op so implementations override only what
/// they care about.
pub trait CacheEventListener: Send + Sync {
    fn on_add(&self, key: &str, region: Option<&str>) -> Result<(), ListenerError> {
        let _ = (key, region);
        Ok(())
    }

    fn on_put(&self, key: &str, region: Option<&str>) -> Result<(), ListenerError> {
        let _ = (key, region);
        Ok(())
    }

    fn on_get(&self, key: &str, region: Option<&str>) -> Result<(), ListenerError> {
        let _ = (key, region);
        Ok(())
    }

    fn on_update(&self, key: &str, region: Option<&str>) -> Result<(), ListenerError> {
        let _ = (key, region);
        Ok(())
    }

    fn on_remove(&self, key: &str, region: Option<&str>) -> Result<(), ListenerError> {
        let _ = (key, region);
        Ok(())
    }

    fn on_clear(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn on_clear_region(&self, region: &str) -> Result<(), ListenerError> {
        let _ = region;
        Ok(())
    }
}

/// Fan one event out to every listener, isolating failures.
pub(crate) fn dispatch<F>(listeners: &[Arc<dyn CacheEventListener>], event: &str, f: F)
where
    F: Fn(&dyn CacheEventListener) -> Result<(), ListenerError>,
{
    for listener in listeners {
        if let Err(e) = f(listener.as_ref()) {
            warn!("cache event listener failed on {}: {}", event, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counting {
        gets: AtomicU64,
    }

    impl CacheEventListener for Counting {
        fn on_get(&self, _key: &str, _region: Option<&str>) -> Result<(), ListenerError> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Failing;

    impl CacheEventListener for Failing {
        fn on_get(&self, _key: &str, _region: Option<&str>) -> Result<(), ListenerError> {
            Err("boom".into())
        }
    }

    #[test]
    fn failing_listener_does_not_stop_fanout() {
        let counting = Arc::new(Counting::default());
        let listeners: Vec<Arc<dyn CacheEventListener>> =
            vec![Arc::new(Failing), counting.clone()];

        dispatch(&listeners, "get", |l| l.on_get("k", None));

        assert_eq!(counting.gets.load(Ordering::Relaxed), 1);
    }
}
