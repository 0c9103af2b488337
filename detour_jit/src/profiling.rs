//! Per-method profiling data.
//!
//! A profile belongs to exactly one method record. Copies of a record must
//! not share it, which is why the method copy routine drops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use detour_core::MethodAddr;

/// Profiling data the JIT collects for one method.
#[derive(Debug)]
pub struct ProfilingInfo {
    owner: MethodAddr,
    samples: AtomicU64,
    being_compiled: AtomicBool,
}

impl ProfilingInfo {
    /// Create empty profiling data owned by `owner`.
    pub fn new(owner: MethodAddr) -> Self {
        Self {
            owner,
            samples: AtomicU64::new(0),
            being_compiled: AtomicBool::new(false),
        }
    }

    /// The method this profile was created for.
    #[inline]
    pub fn owner(&self) -> MethodAddr {
        self.owner
    }

    /// Record one sample.
    #[inline]
    pub fn add_sample(&self) -> u64 {
        self.samples.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of samples recorded.
    #[inline]
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Mark whether a compilation of the owner is in progress.
    #[inline]
    pub fn set_being_compiled(&self, value: bool) {
        self.being_compiled.store(value, Ordering::Release);
    }

    /// Check if a compilation of the owner is in progress.
    #[inline]
    pub fn is_being_compiled(&self) -> bool {
        self.being_compiled.load(Ordering::Acquire)
    }
}
