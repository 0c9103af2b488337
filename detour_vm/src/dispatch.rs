//! Invocation dispatch.
//!
//! ```text
//! invoke(method, args)
//! ├── stack exhausted?          -> StackOverflow, nothing pushed
//! ├── safepoint poll, push transition marker
//! ├── not started / -Xint / debugger
//! │       -> interpreter entry, staying in the interpreter
//! ├── quick entry null          -> log, zero result
//! └── quick entry
//!         ├── Return(v)          -> v
//!         └── Deoptimize         -> interpret the frame's current method
//! ```

use detour_core::{Value, VmError, VmResult};
use detour_runtime::MethodRef;
use tracing::{debug, info, trace};

use crate::entrypoints::{InvokeContext, QuickOutcome, split_receiver};
use crate::runtime::Runtime;
use crate::thread::ManagedThread;

impl Runtime {
    /// Invoke `method` on `thread` with packed `args` (receiver first for
    /// instance methods).
    pub fn invoke(&self, thread: &ManagedThread, method: &MethodRef, args: &[Value]) -> VmResult<Value> {
        let depth = thread.stack_depth();
        let limit = thread.stack_limit();
        if depth >= limit {
            return Err(VmError::StackOverflow { depth, limit });
        }

        self.threads().poll_safepoint(thread);
        let _fragment = thread.push_fragment();
        let (receiver, rest) = split_receiver(method, args)?;

        let forced = !self.is_started()
            || self.config().interpret_only
            || self.debugger().is_forced_interpreter_needed_for_calling(thread, method);
        if forced {
            return self.invoke_interpreted(thread, method, args);
        }

        let code = method.entry_point_from_quick_compiled_code();
        if code.is_null() {
            info!("Not invoking '{}' code=null", method.pretty_method());
            return Ok(Value::zero());
        }
        let log = self.config().log_invocations;
        if log {
            trace!(method = %method.pretty_method(), %code, depth, "invoke");
        }

        let frame = thread.push_frame(method.clone());
        let cx = InvokeContext::new(self, thread, Some(frame.id()));
        let instrumented = self.instrumentation().is_active();
        let code = if instrumented {
            self.instrumentation()
                .method_entry_from_code(thread, frame.id(), method, receiver)
        } else {
            code
        };

        let result = self
            .stubs()
            .resolve(code)
            .and_then(|quick| quick.call(&cx, method, args))
            .and_then(|outcome| match outcome {
                QuickOutcome::Return(value) => Ok(value),
                QuickOutcome::Deoptimize => {
                    thread.stats().record_deoptimization();
                    let current = frame.current_method().unwrap_or_else(|| method.clone());
                    debug!(
                        method = %method.pretty_method(),
                        resumed = %current.pretty_method(),
                        "deoptimizing into the interpreter"
                    );
                    self.interpreter()
                        .execute(&cx.staying_in_interpreter(), &current, receiver, rest, true)
                }
            });

        if instrumented {
            self.instrumentation().method_exit_from_code(thread, frame.id());
        }
        if log {
            trace!(method = %method.pretty_method(), ok = result.is_ok(), "returned");
        }
        result
    }

    /// Run `method` through its interpreter entry.
    fn invoke_interpreted(&self, thread: &ManagedThread, method: &MethodRef, args: &[Value]) -> VmResult<Value> {
        let bridge = method.entry_point_from_interpreter();
        if bridge.is_null() {
            info!("Not invoking '{}' code=null", method.pretty_method());
            return Ok(Value::zero());
        }
        let frame = thread.push_frame(method.clone());
        let cx = InvokeContext::new(self, thread, Some(frame.id())).staying_in_interpreter();
        match self.stubs().resolve(bridge)?.call(&cx, method, args)? {
            QuickOutcome::Return(value) => Ok(value),
            QuickOutcome::Deoptimize => Err(VmError::Internal(format!(
                "deoptimization requested while interpreting {}",
                method.pretty_method()
            ))),
        }
    }
}
