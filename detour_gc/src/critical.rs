//! Collection gate and scoped critical sections.
//!
//! A critical section is the collector's half of a stop-the-world window:
//! while one is held no collection may start, so raw references that are
//! being rewritten are never observed half-updated by a tracer.

use std::time::Instant;

use detour_core::fatal;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::GcConfig;
use crate::stats::GcStats;
use crate::{CollectorType, GcCause};

// =============================================================================
// Gate State
// =============================================================================

#[derive(Debug, Default)]
struct GateState {
    /// A collection is currently running.
    collecting: bool,
    /// Number of critical sections currently held.
    critical_sections: u32,
    /// Cause of the running collection, for diagnostics.
    running_cause: Option<GcCause>,
}

// =============================================================================
// Heap
// =============================================================================

/// The runtime's view of the collector.
#[derive(Debug)]
pub struct Heap {
    config: GcConfig,
    state: Mutex<GateState>,
    changed: Condvar,
    stats: GcStats,
}

impl Heap {
    /// Create a heap gate with the given configuration.
    pub fn new(config: GcConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            stats: GcStats::new(),
        }
    }

    /// Get configuration.
    #[inline]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Run a collection unless a critical section forbids it.
    ///
    /// Returns `false` without running `collector` when a critical section
    /// is held. Collections never overlap.
    pub fn collect<F: FnOnce()>(&self, cause: GcCause, collector: F) -> bool {
        {
            let mut state = self.state.lock();
            while state.collecting {
                self.changed.wait(&mut state);
            }
            if state.critical_sections > 0 {
                self.stats.record_refused();
                if self.config.trace {
                    debug!(?cause, "collection refused inside critical section");
                }
                return false;
            }
            state.collecting = true;
            state.running_cause = Some(cause);
        }

        let start = Instant::now();
        collector();
        let elapsed = start.elapsed();

        let mut state = self.state.lock();
        state.collecting = false;
        state.running_cause = None;
        self.changed.notify_all();
        drop(state);

        self.stats.record_collection(elapsed);
        if self.config.trace {
            debug!(?cause, ?elapsed, "collection finished");
        }
        true
    }

    /// Enter a critical section that forbids collection until dropped.
    ///
    /// Waits for a running collection to finish first.
    pub fn enter_critical_section(
        &self,
        cause: GcCause,
        collector_type: CollectorType,
    ) -> GcCriticalSection<'_> {
        let mut state = self.state.lock();
        while state.collecting {
            self.changed.wait(&mut state);
        }
        state.critical_sections += 1;
        drop(state);

        if self.config.trace {
            debug!(?cause, ?collector_type, "entered GC critical section");
        }
        GcCriticalSection {
            heap: self,
            cause,
            collector_type,
            start: Instant::now(),
        }
    }

    /// Check if any critical section is currently held.
    pub fn in_critical_section(&self) -> bool {
        self.state.lock().critical_sections > 0
    }

    /// Check if a collection is running.
    pub fn is_collecting(&self) -> bool {
        self.state.lock().collecting
    }

    fn exit_critical_section(&self, section: &GcCriticalSection<'_>) {
        let mut state = self.state.lock();
        if state.critical_sections == 0 {
            if self.config.verify_critical_sections {
                fatal!(
                    "GC critical section {:?}/{:?} released twice",
                    section.cause,
                    section.collector_type
                );
            }
        } else {
            state.critical_sections -= 1;
        }
        self.changed.notify_all();
        drop(state);

        let elapsed = section.start.elapsed();
        self.stats.record_critical_section(elapsed);
        if self.config.trace {
            debug!(cause = ?section.cause, ?elapsed, "left GC critical section");
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

// =============================================================================
// Critical Section Guard
// =============================================================================

/// RAII guard that keeps collection blocked until dropped.
pub struct GcCriticalSection<'a> {
    heap: &'a Heap,
    cause: GcCause,
    collector_type: CollectorType,
    start: Instant,
}

impl GcCriticalSection<'_> {
    /// Why the section was entered.
    #[inline]
    pub fn cause(&self) -> GcCause {
        self.cause
    }

    /// Pseudo-collector holding the section.
    #[inline]
    pub fn collector_type(&self) -> CollectorType {
        self.collector_type
    }
}

impl Drop for GcCriticalSection<'_> {
    fn drop(&mut self) {
        self.heap.exit_critical_section(self);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_collect_runs_outside_critical_section() {
        let heap = Heap::default();
        let mut ran = false;
        assert!(heap.collect(GcCause::Explicit, || ran = true));
        assert!(ran);
        assert_eq!(heap.stats().collection_count(), 1);
    }

    #[test]
    fn test_critical_section_refuses_collection() {
        let heap = Heap::new(GcConfig::for_testing());
        {
            let section = heap.enter_critical_section(GcCause::Hook, CollectorType::Hook);
            assert_eq!(section.cause(), GcCause::Hook);
            assert!(heap.in_critical_section());
            assert!(!heap.collect(GcCause::Alloc, || panic!("must not run")));
        }
        assert!(!heap.in_critical_section());
        assert!(heap.collect(GcCause::Alloc, || {}));
        assert_eq!(heap.stats().refused_count(), 1);
        assert_eq!(heap.stats().critical_section_count(), 1);
    }

    #[test]
    fn test_nested_critical_sections() {
        let heap = Heap::default();
        let outer = heap.enter_critical_section(GcCause::Hook, CollectorType::Hook);
        let inner = heap.enter_critical_section(GcCause::Jit, CollectorType::CriticalSection);
        drop(outer);
        assert!(heap.in_critical_section());
        drop(inner);
        assert!(!heap.in_critical_section());
    }

    #[test]
    fn test_critical_section_waits_for_running_collection() {
        let heap = Arc::new(Heap::default());
        let finished = Arc::new(AtomicBool::new(false));

        let collector = {
            let heap = Arc::clone(&heap);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                heap.collect(GcCause::Explicit, || {
                    thread::sleep(Duration::from_millis(30));
                    finished.store(true, Ordering::SeqCst);
                })
            })
        };

        while !heap.is_collecting() && !finished.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        let _section = heap.enter_critical_section(GcCause::Hook, CollectorType::Hook);
        assert!(finished.load(Ordering::SeqCst));
        assert!(collector.join().unwrap());
    }
}
