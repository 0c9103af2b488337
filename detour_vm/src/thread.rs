//! Managed threads and their frame stacks.
//!
//! Each attached thread owns a stack of [`StackFrame`]s, one per managed
//! invocation in progress, plus the transition markers pushed by the
//! dispatcher and the instrumentation records shadowing instrumented frames.
//! Everything lives behind one mutex so the stack rewriter can update a
//! parked thread's frames while that thread is suspended.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use detour_runtime::MethodRef;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::instrumentation::InstrumentationRecord;

/// Identifier of a frame, unique per thread.
pub type FrameId = u64;

// =============================================================================
// ThreadState
// =============================================================================

/// State of a managed thread with respect to suspension.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code; must reach a safepoint before a world stop.
    Runnable = 0,
    /// Parked at a safepoint poll.
    AtSafepoint = 1,
    /// Blocked in a wait that touches no managed state.
    Blocked = 2,
    /// Outside managed code (attaching, detaching, native work).
    Native = 3,
}

impl ThreadState {
    #[inline]
    fn from_u32(raw: u32) -> Self {
        match raw {
            1 => ThreadState::AtSafepoint,
            2 => ThreadState::Blocked,
            3 => ThreadState::Native,
            _ => ThreadState::Runnable,
        }
    }

    /// Check if a world stop may proceed while a thread is in this state.
    #[inline]
    pub fn is_suspended(self) -> bool {
        !matches!(self, ThreadState::Runnable)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One managed invocation in progress.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub(crate) id: FrameId,
    pub(crate) method: MethodRef,
    pub(crate) inlined: SmallVec<[MethodRef; 2]>,
}

impl StackFrame {
    /// Frame id.
    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Method this frame executes.
    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Methods inlined into this frame's compiled code, outermost first.
    #[inline]
    pub fn inlined(&self) -> &[MethodRef] {
        &self.inlined
    }
}

/// Mutable stack state of one thread.
#[derive(Debug, Default)]
pub(crate) struct ThreadStack {
    pub(crate) frames: Vec<StackFrame>,
    pub(crate) fragments: usize,
    pub(crate) instrumentation: Vec<InstrumentationRecord>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-thread counters.
#[derive(Debug, Default)]
pub struct ThreadStats {
    fragments_pushed: AtomicU64,
    deoptimizations: AtomicU64,
    frames_rewritten: AtomicU64,
}

impl ThreadStats {
    /// Transition markers pushed over the thread's lifetime.
    pub fn fragments_pushed(&self) -> u64 {
        self.fragments_pushed.load(Ordering::Relaxed)
    }

    /// Compiled calls that fell back to the interpreter.
    pub fn deoptimizations(&self) -> u64 {
        self.deoptimizations.load(Ordering::Relaxed)
    }

    /// Frame and inlined-frame references rewritten by hook installs.
    pub fn frames_rewritten(&self) -> u64 {
        self.frames_rewritten.load(Ordering::Relaxed)
    }

    pub(crate) fn record_deoptimization(&self) {
        self.deoptimizations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rewritten(&self, count: usize) {
        self.frames_rewritten.fetch_add(count as u64, Ordering::Relaxed);
    }
}

// =============================================================================
// ManagedThread
// =============================================================================

/// A thread attached to the runtime.
#[derive(Debug)]
pub struct ManagedThread {
    id: u64,
    name: String,
    state: AtomicU32,
    stack: Mutex<ThreadStack>,
    stack_limit: usize,
    next_frame_id: AtomicU64,
    stats: ThreadStats,
}

impl ManagedThread {
    pub(crate) fn new(id: u64, name: impl Into<String>, stack_limit: usize) -> Self {
        Self {
            id,
            name: name.into(),
            state: AtomicU32::new(ThreadState::Native as u32),
            stack: Mutex::new(ThreadStack::default()),
            stack_limit,
            next_frame_id: AtomicU64::new(1),
            stats: ThreadStats::default(),
        }
    }

    /// Thread id, unique per runtime.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Thread name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current suspension state.
    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Only called with the thread list's control lock held.
    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Maximum frame depth.
    #[inline]
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    /// Frames currently on the stack.
    pub fn stack_depth(&self) -> usize {
        self.stack.lock().frames.len()
    }

    /// Transition markers currently pushed.
    pub fn fragment_depth(&self) -> usize {
        self.stack.lock().fragments
    }

    /// Counters.
    #[inline]
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    /// Methods on the stack, innermost last.
    pub fn frame_methods(&self) -> Vec<MethodRef> {
        self.stack.lock().frames.iter().map(|f| f.method.clone()).collect()
    }

    /// Snapshot of the stack, innermost last.
    pub fn frames(&self) -> Vec<StackFrame> {
        self.stack.lock().frames.clone()
    }

    /// Method currently executed by frame `id`.
    pub fn frame_method(&self, id: FrameId) -> Option<MethodRef> {
        self.stack
            .lock()
            .frames
            .iter()
            .rev()
            .find(|f| f.id == id)
            .map(|f| f.method.clone())
    }

    /// Methods inlined into frame `id`.
    pub fn inlined_methods(&self, id: FrameId) -> SmallVec<[MethodRef; 2]> {
        self.stack
            .lock()
            .frames
            .iter()
            .rev()
            .find(|f| f.id == id)
            .map(|f| f.inlined.clone())
            .unwrap_or_default()
    }

    pub(crate) fn record_inlined(&self, id: FrameId, method: MethodRef) {
        if let Some(frame) = self.stack.lock().frames.iter_mut().rev().find(|f| f.id == id) {
            frame.inlined.push(method);
        }
    }

    pub(crate) fn with_stack<R>(&self, f: impl FnOnce(&mut ThreadStack) -> R) -> R {
        f(&mut self.stack.lock())
    }

    /// Push a managed-to-runtime transition marker.
    pub(crate) fn push_fragment(&self) -> FragmentGuard<'_> {
        self.stack.lock().fragments += 1;
        self.stats.fragments_pushed.fetch_add(1, Ordering::Relaxed);
        FragmentGuard { thread: self }
    }

    /// Push a frame executing `method`.
    pub(crate) fn push_frame(&self, method: MethodRef) -> FrameGuard<'_> {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        self.stack.lock().frames.push(StackFrame {
            id,
            method,
            inlined: SmallVec::new(),
        });
        FrameGuard { thread: self, id }
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Pops a transition marker when dropped.
#[must_use]
pub(crate) struct FragmentGuard<'a> {
    thread: &'a ManagedThread,
}

impl Drop for FragmentGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.thread.stack.lock();
        stack.fragments = stack.fragments.saturating_sub(1);
    }
}

/// Pops a frame when dropped.
#[must_use]
pub(crate) struct FrameGuard<'a> {
    thread: &'a ManagedThread,
    id: FrameId,
}

impl FrameGuard<'_> {
    #[inline]
    pub(crate) fn id(&self) -> FrameId {
        self.id
    }

    /// Method the frame executes now, which a hook install may have changed.
    pub(crate) fn current_method(&self) -> Option<MethodRef> {
        self.thread.frame_method(self.id)
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let mut stack = self.thread.stack.lock();
        if let Some(pos) = stack.frames.iter().rposition(|f| f.id == self.id) {
            stack.frames.truncate(pos);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use detour_runtime::{AccessFlags, ClassDef, ClassLinker, ClassLoaderId, DexFile, MethodDef, PointerSize};

    fn method() -> MethodRef {
        let mut builder = DexFile::builder("thread_test.dex");
        let idx = builder.add_method("LT;", "run", "V", &[]);
        let dex = builder.build();
        let linker = ClassLinker::new(PointerSize::Bits64);
        let class = linker
            .define_class(
                ClassDef::new(ClassLoaderId::BOOT, dex, "LT;")
                    .with_method(MethodDef::new(idx, AccessFlags::PUBLIC | AccessFlags::STATIC)),
            )
            .unwrap();
        class.direct_methods()[0].clone()
    }

    #[test]
    fn test_state_round_trip() {
        let thread = ManagedThread::new(1, "t", 8);
        assert_eq!(thread.state(), ThreadState::Native);
        thread.set_state(ThreadState::Runnable);
        assert_eq!(thread.state(), ThreadState::Runnable);
        assert!(!thread.state().is_suspended());
        thread.set_state(ThreadState::Blocked);
        assert!(thread.state().is_suspended());
    }

    #[test]
    fn test_frames_pop_in_order() {
        let thread = ManagedThread::new(1, "t", 8);
        let m = method();
        {
            let outer = thread.push_frame(m.clone());
            {
                let inner = thread.push_frame(m.clone());
                assert_eq!(thread.stack_depth(), 2);
                assert!(inner.id() > outer.id());
                assert_eq!(thread.frame_method(inner.id()), Some(m.clone()));
            }
            assert_eq!(thread.stack_depth(), 1);
        }
        assert_eq!(thread.stack_depth(), 0);
    }

    #[test]
    fn test_fragments_balanced() {
        let thread = ManagedThread::new(1, "t", 8);
        {
            let _a = thread.push_fragment();
            let _b = thread.push_fragment();
            assert_eq!(thread.fragment_depth(), 2);
        }
        assert_eq!(thread.fragment_depth(), 0);
        assert_eq!(thread.stats().fragments_pushed(), 2);
    }

    #[test]
    fn test_inlined_recorded_on_frame() {
        let thread = ManagedThread::new(1, "t", 8);
        let m = method();
        let frame = thread.push_frame(m.clone());
        thread.record_inlined(frame.id(), m.clone());
        assert_eq!(thread.inlined_methods(frame.id()).as_slice(), &[m]);
        drop(frame);
        assert!(thread.inlined_methods(1).is_empty());
    }
}
