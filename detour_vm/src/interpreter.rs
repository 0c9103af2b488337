//! Interpreter and debugger seams.
//!
//! The runtime does not decode bytecode itself. An [`Interpreter`] executes
//! a method body given its dex data; [`TableInterpreter`] looks bodies up by
//! `(dex location, code item offset)`, which is exactly the state a hook
//! backup shares with its original.

use std::sync::Arc;

use dashmap::DashMap;
use detour_core::{Value, VmError, VmResult, stubs};
use detour_runtime::{MethodRecord, MethodRef};
use tracing::trace;

use crate::entrypoints::{InvokeContext, QuickCode, QuickOutcome, pack_args};
use crate::thread::ManagedThread;

// =============================================================================
// Traits
// =============================================================================

/// Executes methods from their dex data.
pub trait Interpreter: Send + Sync {
    /// Run `method`.
    ///
    /// With `stay_in_interpreter` set, the body runs interpreted even when
    /// compiled code exists.
    fn execute(
        &self,
        cx: &InvokeContext<'_>,
        method: &MethodRef,
        receiver: Option<&Value>,
        args: &[Value],
        stay_in_interpreter: bool,
    ) -> VmResult<Value>;
}

/// Decides when a debugger needs a call to run interpreted.
pub trait DebuggerPolicy: Send + Sync {
    /// Check if `method` must be interpreted on `thread`.
    fn is_forced_interpreter_needed_for_calling(&self, thread: &ManagedThread, method: &MethodRecord) -> bool;
}

/// No debugger attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugger;

impl DebuggerPolicy for NoDebugger {
    #[inline]
    fn is_forced_interpreter_needed_for_calling(&self, _thread: &ManagedThread, _method: &MethodRecord) -> bool {
        false
    }
}

// =============================================================================
// Table Interpreter
// =============================================================================

/// An interpretable method body.
pub type MethodBody =
    Arc<dyn Fn(&InvokeContext<'_>, Option<&Value>, &[Value]) -> VmResult<Value> + Send + Sync>;

/// Interpreter over registered method bodies.
#[derive(Default)]
pub struct TableInterpreter {
    bodies: DashMap<(String, u32), MethodBody>,
}

impl TableInterpreter {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body at `code_item_offset` in the dex file at `location`.
    pub fn register<F>(&self, location: impl Into<String>, code_item_offset: u32, body: F)
    where
        F: Fn(&InvokeContext<'_>, Option<&Value>, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        self.bodies.insert((location.into(), code_item_offset), Arc::new(body));
    }

    /// Register the body of `method` as currently linked.
    pub fn register_method<F>(&self, method: &MethodRecord, body: F) -> VmResult<()>
    where
        F: Fn(&InvokeContext<'_>, Option<&Value>, &[Value]) -> VmResult<Value> + Send + Sync + 'static,
    {
        let dex = method.dex_file().ok_or_else(|| {
            VmError::illegal_argument(format!("{} has no dex file", method.pretty_method()))
        })?;
        let offset = method.code_item_offset();
        if offset == 0 {
            return Err(VmError::illegal_argument(format!(
                "{} has no code item",
                method.pretty_method()
            )));
        }
        self.register(dex.location(), offset, body);
        Ok(())
    }

    fn body_for(&self, method: &MethodRecord) -> Option<MethodBody> {
        let dex = method.dex_file()?;
        self.bodies
            .get(&(dex.location().to_owned(), method.code_item_offset()))
            .map(|b| Arc::clone(b.value()))
    }

    /// Bump hotness and create profiling data once the method is warm.
    fn profile(&self, cx: &InvokeContext<'_>, method: &MethodRecord) {
        let hotness = method.increment_hotness();
        if let Some(jit) = cx.runtime().jit() {
            if jit.is_warm(hotness) {
                method.ensure_profiling_info().add_sample();
            }
        }
    }

    /// Compiled code for `method` in the JIT cache, if registered.
    fn compiled_code(&self, cx: &InvokeContext<'_>, method: &MethodRecord) -> Option<Arc<dyn QuickCode>> {
        let jit = cx.runtime().jit()?;
        if !jit.is_hot(method.hotness_count()) {
            return None;
        }
        let entry = jit.code_cache().lookup(method.addr())?;
        cx.runtime().stubs().get(entry.entry_point())
    }
}

impl Interpreter for TableInterpreter {
    fn execute(
        &self,
        cx: &InvokeContext<'_>,
        method: &MethodRef,
        receiver: Option<&Value>,
        args: &[Value],
        stay_in_interpreter: bool,
    ) -> VmResult<Value> {
        // Redirected and native methods have no interpretable body of their own.
        if method.is_hook_redirected() || method.is_native() {
            let stub = if method.is_hook_redirected() {
                stubs::QUICK_HOOK_TRAMPOLINE
            } else {
                stubs::QUICK_GENERIC_JNI_STUB
            };
            let packed = pack_args(receiver, args);
            return match cx.runtime().stubs().resolve(stub)?.call(cx, method, &packed)? {
                QuickOutcome::Return(value) => Ok(value),
                QuickOutcome::Deoptimize => Err(VmError::Internal(format!(
                    "deoptimization requested by native code of {}",
                    method.pretty_method()
                ))),
            };
        }
        if !method.is_invokable() {
            return Err(method.invocation_time_error());
        }

        self.profile(cx, method);
        if !stay_in_interpreter {
            if let Some(code) = self.compiled_code(cx, method) {
                let packed = pack_args(receiver, args);
                match code.call(cx, method, &packed)? {
                    QuickOutcome::Return(value) => return Ok(value),
                    QuickOutcome::Deoptimize => {
                        trace!(method = %method.pretty_method(), "compiled code deoptimized");
                    }
                }
            }
        }

        match self.body_for(method) {
            Some(body) => body(cx, receiver, args),
            None if method.code_item_offset() == 0 => Ok(Value::zero()),
            None => Err(VmError::Internal(format!(
                "no interpreter body for {}",
                method.pretty_method()
            ))),
        }
    }
}
