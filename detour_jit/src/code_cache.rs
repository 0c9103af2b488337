//! Code cache for compiled methods.
//!
//! The code cache provides:
//! - Containment checks for arbitrary code addresses
//! - Lookup of the method header covering a program counter
//! - Per-method bookkeeping that can be invalidated or migrated to
//!   another method record (used when a method is hooked)
//! - Hit, miss and migration counters

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use detour_core::{CodeAddress, MethodAddr};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::JitError;

/// Alignment of every committed code blob.
pub const CODE_ALIGNMENT: usize = 16;

// =============================================================================
// Method Header
// =============================================================================

/// Header describing one compiled code blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHeader {
    /// Method the code was compiled for.
    pub method: MethodAddr,
    /// First byte of the code.
    pub code_start: CodeAddress,
    /// Size of the code in bytes.
    pub code_size: usize,
    /// Frame size used by the code.
    pub frame_size: u32,
}

impl MethodHeader {
    /// Check if this code contains a given program counter.
    #[inline]
    pub fn contains(&self, pc: usize) -> bool {
        let base = self.code_start.raw();
        pc >= base && pc < base + self.code_size
    }

    /// Entry point of the code.
    #[inline]
    pub fn entry_point(&self) -> CodeAddress {
        self.code_start
    }
}

// =============================================================================
// Compiled Entry
// =============================================================================

/// An entry in the code cache representing compiled code for a method.
#[derive(Debug)]
pub struct CompiledEntry {
    header: MethodHeader,
    /// Number of times this code has been entered.
    call_count: AtomicU64,
}

impl CompiledEntry {
    /// Create a new entry.
    pub fn new(header: MethodHeader) -> Self {
        Self {
            header,
            call_count: AtomicU64::new(0),
        }
    }

    /// The same code, now owned by another method.
    fn rebind(&self, method: MethodAddr) -> Self {
        Self {
            header: MethodHeader {
                method,
                ..self.header
            },
            call_count: AtomicU64::new(self.call_count()),
        }
    }

    /// Get the method header.
    #[inline]
    pub fn header(&self) -> &MethodHeader {
        &self.header
    }

    /// Method owning this code.
    #[inline]
    pub fn method(&self) -> MethodAddr {
        self.header.method
    }

    /// Get the entry point address.
    #[inline]
    pub fn entry_point(&self) -> CodeAddress {
        self.header.entry_point()
    }

    /// Get the code size.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.header.code_size
    }

    /// Increment call count and return the new value.
    #[inline]
    pub fn increment_call_count(&self) -> u64 {
        self.call_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get call count.
    #[inline]
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Code Cache
// =============================================================================

#[derive(Debug, Default)]
struct CacheTables {
    /// Live entries keyed by code start.
    by_start: BTreeMap<usize, Arc<CompiledEntry>>,
    /// Code starts owned by each method (regular and OSR code).
    by_method: FxHashMap<MethodAddr, Vec<usize>>,
    /// Methods whose bookkeeping moved to a successor record.
    obsolete: FxHashMap<MethodAddr, MethodAddr>,
    /// Bump offset of the next commit.
    next_offset: usize,
}

/// A cache for compiled code, reserved as one contiguous address region.
///
/// Thread-safe via internal locking.
#[derive(Debug)]
pub struct CodeCache {
    base: CodeAddress,
    capacity: usize,
    tables: RwLock<CacheTables>,
    /// Lookup hit counter.
    hits: AtomicU64,
    /// Lookup miss counter.
    misses: AtomicU64,
    /// Commit counter.
    insertions: AtomicU64,
    /// Invalidated entry counter.
    invalidations: AtomicU64,
    /// Entries migrated to another method.
    migrations: AtomicU64,
}

impl CodeCache {
    /// Create a cache covering `[base, base + capacity)`.
    pub fn new(base: CodeAddress, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            tables: RwLock::new(CacheTables::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
        }
    }

    /// Check if `pc` lies inside the cache region.
    ///
    /// This is a region check: code that was invalidated still counts,
    /// since the address can no longer be trusted as a standalone entry.
    #[inline]
    pub fn contains_pc(&self, pc: CodeAddress) -> bool {
        pc.raw() >= self.base.raw() && pc.raw() < self.base.raw() + self.capacity
    }

    /// Commit `code_size` bytes of code for `method`.
    pub fn commit(
        &self,
        method: MethodAddr,
        code_size: usize,
        frame_size: u32,
    ) -> Result<Arc<CompiledEntry>, JitError> {
        if code_size == 0 {
            return Err(JitError::EmptyCode(method));
        }
        let aligned = code_size.div_ceil(CODE_ALIGNMENT) * CODE_ALIGNMENT;

        let mut tables = self.tables.write();
        let available = self.capacity - tables.next_offset;
        if aligned > available {
            return Err(JitError::CodeCacheFull {
                requested: aligned,
                available,
            });
        }

        let code_start = self.base.offset(tables.next_offset);
        tables.next_offset += aligned;

        let entry = Arc::new(CompiledEntry::new(MethodHeader {
            method,
            code_start,
            code_size,
            frame_size,
        }));
        tables.by_start.insert(code_start.raw(), Arc::clone(&entry));
        tables
            .by_method
            .entry(method)
            .or_default()
            .push(code_start.raw());

        self.insertions.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    /// Most recent live code for `method`.
    pub fn lookup(&self, method: MethodAddr) -> Option<Arc<CompiledEntry>> {
        let tables = self.tables.read();
        let result = tables
            .by_method
            .get(&method)
            .and_then(|starts| starts.last())
            .and_then(|start| tables.by_start.get(start))
            .cloned();
        drop(tables);

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Check if the cache holds live code for `method`.
    pub fn contains_method(&self, method: MethodAddr) -> bool {
        self.tables
            .read()
            .by_method
            .get(&method)
            .is_some_and(|starts| !starts.is_empty())
    }

    /// Find the live entry containing the given program counter.
    pub fn find_by_pc(&self, pc: CodeAddress) -> Option<Arc<CompiledEntry>> {
        let tables = self.tables.read();
        tables
            .by_start
            .range(..=pc.raw())
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.header().contains(pc.raw()))
            .cloned()
    }

    /// Header of the code owned by `method` that contains `pc`.
    pub fn lookup_method_header(&self, pc: CodeAddress, method: MethodAddr) -> Option<MethodHeader> {
        self.find_by_pc(pc)
            .filter(|entry| entry.method() == method)
            .map(|entry| *entry.header())
    }

    /// Drop all live code owned by `method`.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_compiled_code_for(&self, method: MethodAddr) -> usize {
        let mut tables = self.tables.write();
        let Some(starts) = tables.by_method.remove(&method) else {
            return 0;
        };
        for start in &starts {
            tables.by_start.remove(start);
        }
        drop(tables);

        self.invalidations
            .fetch_add(starts.len() as u64, Ordering::Relaxed);
        debug!(%method, count = starts.len(), "invalidated compiled code");
        starts.len()
    }

    /// Move every piece of bookkeeping owned by `old` over to `new`.
    ///
    /// Used when `old` is about to be repurposed in place and `new` takes
    /// over its previous implementation. Returns the number of entries moved.
    pub fn move_obsolete_method(&self, old: MethodAddr, new: MethodAddr) -> usize {
        let mut tables = self.tables.write();
        tables.obsolete.insert(old, new);
        let Some(starts) = tables.by_method.remove(&old) else {
            return 0;
        };
        for start in &starts {
            if let Some(entry) = tables.by_start.get(start).cloned() {
                tables.by_start.insert(*start, Arc::new(entry.rebind(new)));
            }
        }
        let moved = starts.len();
        tables.by_method.entry(new).or_default().extend(starts);
        drop(tables);

        self.migrations.fetch_add(moved as u64, Ordering::Relaxed);
        debug!(%old, %new, moved, "moved obsolete method bookkeeping");
        moved
    }

    /// Successor recorded by [`move_obsolete_method`](Self::move_obsolete_method).
    pub fn obsolete_successor(&self, old: MethodAddr) -> Option<MethodAddr> {
        self.tables.read().obsolete.get(&old).copied()
    }

    /// Get the number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.tables.read().by_start.len()
    }

    /// Check if the cache holds no live entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.tables.read().next_offset
    }

    /// Region start.
    #[inline]
    pub fn base(&self) -> CodeAddress {
        self.base
    }

    /// Region size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the code cache.
#[derive(Debug, Default, Clone)]
pub struct CodeCacheStats {
    /// Number of lookup hits.
    pub hits: u64,
    /// Number of lookup misses.
    pub misses: u64,
    /// Number of commits.
    pub insertions: u64,
    /// Number of invalidated entries.
    pub invalidations: u64,
    /// Number of entries migrated between methods.
    pub migrations: u64,
}

impl CodeCacheStats {
    /// Calculate hit rate.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
