//! Per-tier cache statistics
//!
//! Counters mutate via relaxed atomic adds on the hot path; reads are
//! lock-free and may be slightly stale.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics block owned by the manager, one per tier.
#[derive(Debug, Default)]
pub struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
    items: AtomicU64,
    add_calls: AtomicU64,
    put_calls: AtomicU64,
    remove_calls: AtomicU64,
    clear_calls: AtomicU64,
    clear_region_calls: AtomicU64,
}

impl TierStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_add(&self) {
        self.add_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_put(&self) {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remove(&self) {
        self.remove_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clear(&self) {
        self.clear_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clear_region(&self) {
        self.clear_region_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_added(&self) {
        self.items.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn item_removed(&self) {
        // Saturating: an expired item may be removed without ever having
        // been counted here.
        let _ = self
            .items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Reset every counter. The manager calls this on clear/clear_region.
    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.items.store(0, Ordering::Relaxed);
        self.add_calls.store(0, Ordering::Relaxed);
        self.put_calls.store(0, Ordering::Relaxed);
        self.remove_calls.store(0, Ordering::Relaxed);
        self.clear_calls.store(0, Ordering::Relaxed);
        self.clear_region_calls.store(0, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            add_calls: self.add_calls.load(Ordering::Relaxed),
            put_calls: self.put_calls.load(Ordering::Relaxed),
            remove_calls: self.remove_calls.load(Ordering::Relaxed),
            clear_calls: self.clear_calls.load(Ordering::Relaxed),
            clear_region_calls: self.clear_region_calls.load(Ordering::Relaxed),
        }
    }
}

/// Plain snapshot of one tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub items: u64,
    pub add_calls: u64,
    pub put_calls: u64,
    pub remove_calls: u64,
    pub clear_calls: u64,
    pub clear_region_calls: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = (self.hits + self.misses) as f64;
        if total == 0.0 {
            0.0
        } else {
            self.hits as f64 / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = TierStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.item_added();

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.items, 1);
        assert!((snap.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn item_count_never_underflows() {
        let stats = TierStats::new();
        stats.item_removed();
        assert_eq!(stats.snapshot().items, 0);
    }
}
