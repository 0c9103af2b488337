//! Method entry/exit instrumentation.
//!
//! While active, every compiled-code invocation pushes an
//! [`InstrumentationRecord`] on entry and pops it on exit. Each record
//! mirrors the frame it shadows: exiting a frame whose record names a
//! different method means the shadow stack was not resynchronised after a
//! rewrite, which is fatal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use detour_core::{CodeAddress, Value, fatal, stubs};
use detour_runtime::MethodRef;
use tracing::debug;

use crate::thread::{FrameId, ManagedThread};

/// Shadow of one instrumented frame.
#[derive(Debug, Clone)]
pub struct InstrumentationRecord {
    frame_id: FrameId,
    method: MethodRef,
    receiver: Option<Value>,
}

impl InstrumentationRecord {
    /// Frame this record shadows.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Method recorded on entry, or after the last resync.
    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Receiver recorded on entry.
    #[inline]
    pub fn receiver(&self) -> Option<&Value> {
        self.receiver.as_ref()
    }
}

// =============================================================================
// Instrumentation
// =============================================================================

/// Entry/exit instrumentation state.
#[derive(Debug)]
pub struct Instrumentation {
    active: AtomicBool,
    interpret_only: bool,
    entries: AtomicU64,
    exits: AtomicU64,
    resyncs: AtomicU64,
}

impl Instrumentation {
    /// Inactive instrumentation.
    pub fn new(interpret_only: bool) -> Self {
        Self {
            active: AtomicBool::new(false),
            interpret_only,
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
        }
    }

    /// Start instrumenting new invocations.
    pub fn enable(&self) {
        self.active.store(true, Ordering::Release);
        debug!("instrumentation enabled");
    }

    /// Stop instrumenting new invocations. Records already pushed still pop.
    pub fn disable(&self) {
        self.active.store(false, Ordering::Release);
        debug!("instrumentation disabled");
    }

    /// Check if new invocations are instrumented.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Records pushed.
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Records popped.
    pub fn exit_count(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }

    /// Records updated by [`instrument_thread_stack`](Self::instrument_thread_stack).
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Code an instrumented call to `method` should run.
    pub fn quick_code_for(&self, method: &MethodRef) -> CodeAddress {
        if self.interpret_only && !method.is_native() && !method.is_hook_redirected() {
            return stubs::QUICK_TO_INTERPRETER_BRIDGE;
        }
        method.entry_point_from_quick_compiled_code()
    }

    /// Record entry into `method` on frame `frame_id` and return the code to
    /// run.
    pub fn method_entry_from_code(
        &self,
        thread: &ManagedThread,
        frame_id: FrameId,
        method: &MethodRef,
        receiver: Option<&Value>,
    ) -> CodeAddress {
        let code = self.quick_code_for(method);
        if code.is_null() {
            fatal!("instrumented entry into {} with null code", method.pretty_method());
        }
        thread.with_stack(|stack| {
            stack.instrumentation.push(InstrumentationRecord {
                frame_id,
                method: method.clone(),
                receiver: receiver.cloned(),
            })
        });
        self.entries.fetch_add(1, Ordering::Relaxed);
        code
    }

    /// Pop the record for frame `frame_id`.
    pub fn method_exit_from_code(&self, thread: &ManagedThread, frame_id: FrameId) -> InstrumentationRecord {
        let (record, frame_method) = thread.with_stack(|stack| {
            let record = stack.instrumentation.pop();
            let frame_method = stack
                .frames
                .iter()
                .rev()
                .find(|f| f.id == frame_id)
                .map(|f| f.method.clone());
            (record, frame_method)
        });
        let Some(record) = record else {
            fatal!("instrumentation stack empty on exit from frame {frame_id}");
        };
        if record.frame_id != frame_id {
            fatal!(
                "instrumentation record for frame {} popped on exit from frame {}",
                record.frame_id,
                frame_id
            );
        }
        if let Some(frame_method) = frame_method {
            if frame_method != record.method {
                fatal!(
                    "instrumentation record names {} but frame runs {}",
                    record.method.pretty_method(),
                    frame_method.pretty_method()
                );
            }
        }
        self.exits.fetch_add(1, Ordering::Relaxed);
        record
    }

    /// Bring the records on `thread` back in line with its frames.
    ///
    /// Returns the number of records updated.
    pub fn instrument_thread_stack(&self, thread: &ManagedThread) -> usize {
        let updated = thread.with_stack(|stack| {
            let mut updated = 0;
            for record in stack.instrumentation.iter_mut() {
                let Some(frame) = stack.frames.iter().find(|f| f.id == record.frame_id) else {
                    continue;
                };
                if frame.method != record.method {
                    record.method = frame.method.clone();
                    updated += 1;
                }
            }
            updated
        });
        if updated > 0 {
            self.resyncs.fetch_add(updated as u64, Ordering::Relaxed);
            debug!(thread = thread.id(), updated, "instrumentation records resynchronised");
        }
        updated
    }
}

// =============================================================================
// Tests
// =============================================================================
