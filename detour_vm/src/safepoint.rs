//! The composite stop-the-world window used for hook installation.
//!
//! Acquisition order, released in reverse when [`ScopedWorldStop`] drops:
//!
//! ```text
//! requester leaves runnable      (cannot be asked to suspend itself)
//!   └── JIT compilation suspended  (no commit races the migration)
//!         └── GC critical section    (no collection moves records)
//!               └── suspend all        (every other thread parked)
//! ```
//!
//! Code handed a `&ScopedWorldStop` may mutate entry points and rewrite any
//! thread's frames; no mutator can observe the intermediate states.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use detour_gc::{CollectorType, GcCause, GcCriticalSection, Heap};
use detour_jit::{Jit, JitSuspendGuard};
use tracing::debug;

use crate::thread::{ManagedThread, ThreadState};
use crate::thread_list::{SuspendAllGuard, ThreadList};

// =============================================================================
// SafepointStats
// =============================================================================

/// Timing of stop-the-world windows.
#[derive(Debug)]
pub struct SafepointStats {
    windows: AtomicU64,
    time_to_stop_ns: AtomicU64,
    pause_time_ns: AtomicU64,
    max_pause_ns: AtomicU64,
}

impl SafepointStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self {
            windows: AtomicU64::new(0),
            time_to_stop_ns: AtomicU64::new(0),
            pause_time_ns: AtomicU64::new(0),
            max_pause_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_stopped(&self, time_to_stop: Duration) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        self.time_to_stop_ns
            .fetch_add(time_to_stop.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_pause(&self, pause: Duration) {
        let nanos = pause.as_nanos() as u64;
        self.pause_time_ns.fetch_add(nanos, Ordering::Relaxed);
        let mut current = self.max_pause_ns.load(Ordering::Relaxed);
        while nanos > current {
            match self.max_pause_ns.compare_exchange_weak(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Windows entered.
    #[inline]
    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    /// Average time from request to every thread parked.
    pub fn avg_time_to_stop(&self) -> Duration {
        let count = self.windows();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.time_to_stop_ns.load(Ordering::Relaxed) / count)
    }

    /// Total time spent with the world stopped.
    #[inline]
    pub fn total_pause_time(&self) -> Duration {
        Duration::from_nanos(self.pause_time_ns.load(Ordering::Relaxed))
    }

    /// Longest single window.
    #[inline]
    pub fn max_pause_time(&self) -> Duration {
        Duration::from_nanos(self.max_pause_ns.load(Ordering::Relaxed))
    }
}

impl Default for SafepointStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Self Suspension
// =============================================================================

/// Moves the requester out of runnable for the window's lifetime.
struct ScopedThreadSuspension<'a> {
    threads: &'a ThreadList,
    thread: &'a ManagedThread,
    was_runnable: bool,
}

impl<'a> ScopedThreadSuspension<'a> {
    fn new(threads: &'a ThreadList, thread: &'a ManagedThread) -> Self {
        let was_runnable = !thread.state().is_suspended();
        if was_runnable {
            threads.transition_from_runnable(thread, ThreadState::Blocked);
        }
        Self {
            threads,
            thread,
            was_runnable,
        }
    }
}

impl Drop for ScopedThreadSuspension<'_> {
    fn drop(&mut self) {
        if self.was_runnable {
            self.threads.transition_to_runnable(self.thread);
        }
    }
}

// =============================================================================
// ScopedWorldStop
// =============================================================================

/// Holds the world stopped until dropped.
#[must_use]
pub struct ScopedWorldStop<'a> {
    // Fields drop in declaration order: innermost acquisition first.
    _threads: SuspendAllGuard<'a>,
    _gc: GcCriticalSection<'a>,
    _jit: Option<JitSuspendGuard<'a>>,
    _self_suspension: ScopedThreadSuspension<'a>,
    stats: &'a SafepointStats,
    reason: &'static str,
    stopped_at: Instant,
}

impl<'a> ScopedWorldStop<'a> {
    /// Stop the world on behalf of `requester`.
    pub fn new(
        threads: &'a ThreadList,
        jit: Option<&'a Jit>,
        heap: &'a Heap,
        stats: &'a SafepointStats,
        requester: &'a ManagedThread,
        reason: &'static str,
    ) -> Self {
        let requested_at = Instant::now();
        let self_suspension = ScopedThreadSuspension::new(threads, requester);
        let jit = jit.map(Jit::suspend);
        let gc = heap.enter_critical_section(GcCause::Hook, CollectorType::Hook);
        let suspend_all = threads.suspend_all(requester);

        let time_to_stop = requested_at.elapsed();
        stats.record_stopped(time_to_stop);
        debug!(reason, ?time_to_stop, "world stopped");

        Self {
            _threads: suspend_all,
            _gc: gc,
            _jit: jit,
            _self_suspension: self_suspension,
            stats,
            reason,
            stopped_at: Instant::now(),
        }
    }

    /// Why the world was stopped.
    #[inline]
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Time since every thread parked.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.stopped_at.elapsed()
    }
}

impl Drop for ScopedWorldStop<'_> {
    fn drop(&mut self) {
        let pause = self.stopped_at.elapsed();
        self.stats.record_pause(pause);
        debug!(reason = self.reason, ?pause, "world resumed");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use detour_gc::GcConfig;
    use detour_jit::JitConfig;

    #[test]
    fn test_window_holds_every_subsystem() {
        let threads = ThreadList::new();
        let jit = Jit::new(JitConfig::for_testing());
        let heap = Heap::new(GcConfig::for_testing());
        let stats = SafepointStats::new();
        let main = threads.attach("main", 8);

        {
            let world = ScopedWorldStop::new(&threads, Some(&jit), &heap, &stats, &main, "test");
            assert_eq!(world.reason(), "test");
            assert!(jit.gate().is_suspended());
            assert!(heap.in_critical_section());
            assert!(threads.is_suspend_pending());
            assert_eq!(main.state(), ThreadState::Blocked);
            assert!(!heap.collect(GcCause::Explicit, || {}));
        }

        assert!(!jit.gate().is_suspended());
        assert!(!heap.in_critical_section());
        assert!(!threads.is_suspend_pending());
        assert_eq!(main.state(), ThreadState::Runnable);
        assert_eq!(stats.windows(), 1);
    }

    #[test]
    fn test_window_without_jit() {
        let threads = ThreadList::new();
        let heap = Heap::default();
        let stats = SafepointStats::default();
        let main = threads.attach("main", 8);
        drop(ScopedWorldStop::new(&threads, None, &heap, &stats, &main, "no-jit"));
        drop(ScopedWorldStop::new(&threads, None, &heap, &stats, &main, "no-jit"));
        assert_eq!(stats.windows(), 2);
        assert!(stats.max_pause_time() <= stats.total_pause_time());
    }
}
