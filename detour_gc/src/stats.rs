//! Collector gate statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics about collections and critical sections.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Number of completed collections.
    pub collections: AtomicU64,
    /// Collections refused because a critical section was held.
    pub refused_collections: AtomicU64,
    /// Number of critical sections granted.
    pub critical_sections: AtomicU64,
    /// Total time spent inside collections (nanoseconds).
    pub collection_time_ns: AtomicU64,
    /// Total time spent inside critical sections (nanoseconds).
    pub critical_time_ns: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            collections: AtomicU64::new(0),
            refused_collections: AtomicU64::new(0),
            critical_sections: AtomicU64::new(0),
            collection_time_ns: AtomicU64::new(0),
            critical_time_ns: AtomicU64::new(0),
        }
    }

    /// Record a finished collection.
    #[inline]
    pub fn record_collection(&self, duration: Duration) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.collection_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a collection that was refused.
    #[inline]
    pub fn record_refused(&self) {
        self.refused_collections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a released critical section.
    #[inline]
    pub fn record_critical_section(&self, duration: Duration) {
        self.critical_sections.fetch_add(1, Ordering::Relaxed);
        self.critical_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Number of completed collections.
    #[inline]
    pub fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Number of refused collections.
    #[inline]
    pub fn refused_count(&self) -> u64 {
        self.refused_collections.load(Ordering::Relaxed)
    }

    /// Number of critical sections released so far.
    #[inline]
    pub fn critical_section_count(&self) -> u64 {
        self.critical_sections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_collection() {
        let stats = GcStats::new();
        stats.record_collection(Duration::from_micros(5));
        stats.record_refused();
        assert_eq!(stats.collection_count(), 1);
        assert_eq!(stats.refused_count(), 1);
        assert_eq!(stats.collection_time_ns.load(Ordering::Relaxed), 5_000);
    }
}
