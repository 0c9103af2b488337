//! Per-class-loader linear arena.
//!
//! Method records and hook descriptors are allocated here and live exactly as
//! long as their class loader. There is no per-object free: the arena is
//! released as a whole.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::method::{MethodRecord, MethodRef};
use crate::reflect::HookDescriptor;
use crate::{ClassLoaderId, PointerSize};

/// Default initial arena capacity in bytes.
pub const DEFAULT_ARENA_CAPACITY: usize = 4096;

#[derive(Debug)]
struct ArenaState {
    capacity: usize,
    used: usize,
    methods: Vec<MethodRef>,
    hook_descriptors: Vec<Arc<HookDescriptor>>,
}

/// Bump allocator scoped to one class loader.
#[derive(Debug)]
pub struct LinearArena {
    loader: ClassLoaderId,
    state: Mutex<ArenaState>,
    grow_count: AtomicU64,
}

impl LinearArena {
    /// Create an arena for `loader`.
    pub fn new(loader: ClassLoaderId, initial_capacity: usize) -> Self {
        Self {
            loader,
            state: Mutex::new(ArenaState {
                capacity: initial_capacity.max(1),
                used: 0,
                methods: Vec::new(),
                hook_descriptors: Vec::new(),
            }),
            grow_count: AtomicU64::new(0),
        }
    }

    /// Owning class loader.
    #[inline]
    pub fn loader(&self) -> ClassLoaderId {
        self.loader
    }

    fn reserve(&self, state: &mut ArenaState, bytes: usize) {
        if state.used + bytes > state.capacity {
            let new_capacity = (state.capacity * 2).max(state.used + bytes);
            debug!(
                loader = %self.loader,
                old = state.capacity,
                new = new_capacity,
                "arena grew"
            );
            state.capacity = new_capacity;
            self.grow_count.fetch_add(1, Ordering::Relaxed);
        }
        state.used += bytes;
    }

    /// Allocate an uninitialized method record.
    pub fn alloc_method(&self, pointer_size: PointerSize) -> MethodRef {
        let mut state = self.state.lock();
        self.reserve(&mut state, MethodRecord::size(pointer_size));
        let method = MethodRef::new(MethodRecord::uninit());
        state.methods.push(method.clone());
        method
    }

    /// Move a hook descriptor into the arena.
    pub fn alloc_hook_descriptor(
        &self,
        descriptor: HookDescriptor,
        pointer_size: PointerSize,
    ) -> Arc<HookDescriptor> {
        let mut state = self.state.lock();
        self.reserve(&mut state, 3 * pointer_size.bytes());
        let descriptor = Arc::new(descriptor);
        state.hook_descriptors.push(Arc::clone(&descriptor));
        descriptor
    }

    /// Check if `method` was allocated here.
    pub fn contains(&self, method: &MethodRef) -> bool {
        self.state.lock().methods.iter().any(|m| m == method)
    }

    /// Bytes handed out.
    pub fn bytes_used(&self) -> usize {
        self.state.lock().used
    }

    /// Current capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of times the arena grew.
    pub fn grow_count(&self) -> u64 {
        self.grow_count.load(Ordering::Relaxed)
    }

    /// Number of method records allocated.
    pub fn method_count(&self) -> usize {
        self.state.lock().methods.len()
    }

    /// Number of hook descriptors allocated.
    pub fn hook_descriptor_count(&self) -> usize {
        self.state.lock().hook_descriptors.len()
    }
}
