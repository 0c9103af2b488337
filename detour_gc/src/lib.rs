//! Detour Garbage Collector Gate
//!
//! The collection algorithms themselves live elsewhere. This crate owns the
//! part of the collector the rest of the runtime coordinates with:
//!
//! - **Collections** run through [`Heap::collect`], one at a time.
//! - **Critical sections** ([`GcCriticalSection`]) forbid any collection
//!   from starting while they are held, and wait for a running one to
//!   finish before they are granted.
//!
//! # Usage
//!
//! ```ignore
//! use detour_gc::{CollectorType, GcCause, GcConfig, Heap};
//!
//! let heap = Heap::new(GcConfig::default());
//! {
//!     let _no_gc = heap.enter_critical_section(GcCause::Hook, CollectorType::Hook);
//!     // raw frame slots may be rewritten here
//! }
//! heap.collect(GcCause::Explicit, || { /* trace and sweep */ });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod critical;
mod stats;

pub use config::GcConfig;
pub use critical::{GcCriticalSection, Heap};
pub use stats::GcStats;

/// Why the collector was engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// Allocation could not be satisfied.
    Alloc,
    /// Explicit request (e.g. `System.gc()`).
    Explicit,
    /// A method hook is rewriting frames.
    Hook,
    /// Code cache or class unloading needs a quiet heap.
    Jit,
}

/// Which collector holds the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorType {
    /// No collector.
    None,
    /// Regular mark-sweep collection.
    MarkSweep,
    /// Pseudo-collector used to block collection while hooks are installed.
    Hook,
    /// Pseudo-collector used by the JIT while it updates its tables.
    CriticalSection,
}
