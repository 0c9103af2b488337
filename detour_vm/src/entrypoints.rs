//! Executable code behind entry-point addresses.
//!
//! Entry-point slots hold plain [`CodeAddress`]es. The [`StubTable`] maps
//! each address the runtime may jump to onto a [`QuickCode`] implementation:
//! the runtime stubs in the reserved region, registered native functions,
//! and code committed to the JIT cache or recorded as AOT code.
//!
//! Quick code receives packed arguments: the receiver first for instance
//! methods, then the declared parameters.

use std::sync::Arc;

use dashmap::DashMap;
use detour_core::{CodeAddress, Value, VmError, VmResult, stubs};
use detour_runtime::{MethodRef, ReflectedMethod};
use smallvec::SmallVec;

use crate::hook::{HookBridge, HookTrampoline};
use crate::runtime::Runtime;
use crate::thread::{FrameId, ManagedThread};

// =============================================================================
// Quick Code
// =============================================================================

/// How a piece of quick code finished.
#[derive(Debug, Clone)]
pub enum QuickOutcome {
    /// Normal return.
    Return(Value),
    /// The code cannot continue; re-run the invocation in the interpreter.
    Deoptimize,
}

/// Code reachable through an entry-point address.
pub trait QuickCode: Send + Sync {
    /// Run `method` with packed `args`.
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome>;
}

impl<F> QuickCode for F
where
    F: Fn(&InvokeContext<'_>, &MethodRef, &[Value]) -> VmResult<QuickOutcome> + Send + Sync,
{
    #[inline]
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome> {
        self(cx, method, args)
    }
}

/// Wrap a closure as quick code.
pub fn quick_code<F>(code: F) -> Arc<dyn QuickCode>
where
    F: Fn(&InvokeContext<'_>, &MethodRef, &[Value]) -> VmResult<QuickOutcome> + Send + Sync + 'static,
{
    Arc::new(code)
}

/// Split packed arguments into receiver and parameters.
pub fn split_receiver<'v>(method: &MethodRef, args: &'v [Value]) -> VmResult<(Option<&'v Value>, &'v [Value])> {
    if method.is_static() {
        return Ok((None, args));
    }
    match args.split_first() {
        Some((receiver, rest)) => Ok((Some(receiver), rest)),
        None => Err(VmError::illegal_argument(format!(
            "missing receiver for {}",
            method.pretty_method()
        ))),
    }
}

/// Pack a receiver and parameters.
pub fn pack_args(receiver: Option<&Value>, args: &[Value]) -> SmallVec<[Value; 8]> {
    receiver.cloned().into_iter().chain(args.iter().cloned()).collect()
}

// =============================================================================
// Invoke Context
// =============================================================================

/// The thread and runtime an invocation runs on.
#[derive(Clone, Copy)]
pub struct InvokeContext<'a> {
    runtime: &'a Runtime,
    thread: &'a ManagedThread,
    frame: Option<FrameId>,
    stay_in_interpreter: bool,
}

impl<'a> InvokeContext<'a> {
    pub(crate) fn new(runtime: &'a Runtime, thread: &'a ManagedThread, frame: Option<FrameId>) -> Self {
        Self {
            runtime,
            thread,
            frame,
            stay_in_interpreter: false,
        }
    }

    pub(crate) fn staying_in_interpreter(mut self) -> Self {
        self.stay_in_interpreter = true;
        self
    }

    /// Owning runtime.
    #[inline]
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// Current thread.
    #[inline]
    pub fn thread(&self) -> &'a ManagedThread {
        self.thread
    }

    /// Frame of the running invocation.
    #[inline]
    pub fn frame_id(&self) -> Option<FrameId> {
        self.frame
    }

    /// The interpreter must not transfer to compiled code.
    #[inline]
    pub fn stay_in_interpreter(&self) -> bool {
        self.stay_in_interpreter
    }

    /// Method the running frame executes now. A hook installed while the
    /// frame was live reports the backup here.
    pub fn current_method(&self) -> Option<MethodRef> {
        self.frame.and_then(|id| self.thread.frame_method(id))
    }

    /// Note that the running compiled code inlined `method`.
    pub fn record_inlined(&self, method: &MethodRef) {
        if let Some(id) = self.frame {
            self.thread.record_inlined(id, method.clone());
        }
    }

    /// Methods inlined into the running frame.
    pub fn inlined_methods(&self) -> SmallVec<[MethodRef; 2]> {
        self.frame
            .map(|id| self.thread.inlined_methods(id))
            .unwrap_or_default()
    }

    /// Invoke `method` with packed `args` on this thread.
    pub fn invoke(&self, method: &MethodRef, args: &[Value]) -> VmResult<Value> {
        self.runtime.invoke(self.thread, method, args)
    }

    /// Invoke through a reflective handle.
    pub fn invoke_reflected(
        &self,
        handle: &ReflectedMethod,
        receiver: Option<&Value>,
        args: &[Value],
    ) -> VmResult<Value> {
        let method = handle.method();
        if !handle.is_accessible() && method.is_private() {
            return Err(VmError::illegal_argument(format!(
                "cannot access {}",
                method.pretty_method()
            )));
        }
        if method.is_static() {
            return self.invoke(method, args);
        }
        match receiver {
            Some(r) if !r.is_null() => self.invoke(method, &pack_args(Some(r), args)),
            _ => Err(VmError::illegal_argument(format!(
                "null receiver for {}",
                method.pretty_method()
            ))),
        }
    }

    /// Run `f` without holding up world stops.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.runtime.threads().blocking(self.thread, f)
    }

    /// Park if a world stop is pending.
    #[inline]
    pub fn poll_safepoint(&self) {
        self.runtime.threads().poll_safepoint(self.thread);
    }
}

// =============================================================================
// Stub Table
// =============================================================================

/// Code registered at each callable address.
pub struct StubTable {
    code: DashMap<CodeAddress, Arc<dyn QuickCode>>,
}

impl StubTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            code: DashMap::new(),
        }
    }

    /// Table holding the runtime stubs.
    pub(crate) fn with_runtime_stubs(hook_bridge: Arc<HookBridge>) -> Self {
        let table = Self::new();
        table.register(stubs::QUICK_TO_INTERPRETER_BRIDGE, Arc::new(InterpreterBridge));
        table.register(stubs::QUICK_HOOK_TRAMPOLINE, Arc::new(HookTrampoline::new(hook_bridge)));
        table.register(stubs::QUICK_RESOLUTION_STUB, Arc::new(ResolutionStub));
        table.register(stubs::QUICK_GENERIC_JNI_STUB, Arc::new(GenericJniStub));
        table.register(stubs::JNI_DLSYM_LOOKUP_STUB, Arc::new(DlsymLookupStub));
        table
    }

    /// Register code at `address`, replacing whatever was there.
    pub fn register(&self, address: CodeAddress, code: Arc<dyn QuickCode>) {
        self.code.insert(address, code);
    }

    /// Register a closure at `address`.
    pub fn register_fn<F>(&self, address: CodeAddress, code: F)
    where
        F: Fn(&InvokeContext<'_>, &MethodRef, &[Value]) -> VmResult<QuickOutcome> + Send + Sync + 'static,
    {
        self.register(address, quick_code(code));
    }

    /// Code at `address`.
    pub fn get(&self, address: CodeAddress) -> Option<Arc<dyn QuickCode>> {
        self.code.get(&address).map(|c| Arc::clone(c.value()))
    }

    /// Code at `address`, or an internal error.
    pub fn resolve(&self, address: CodeAddress) -> VmResult<Arc<dyn QuickCode>> {
        self.get(address)
            .ok_or_else(|| VmError::Internal(format!("no code registered at {address}")))
    }

    /// Check if code is registered at `address`.
    pub fn contains(&self, address: CodeAddress) -> bool {
        self.code.contains_key(&address)
    }

    /// Registered addresses.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

impl Default for StubTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Runtime Stubs
// =============================================================================

/// Enters the interpreter.
struct InterpreterBridge;

impl QuickCode for InterpreterBridge {
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome> {
        let (receiver, rest) = split_receiver(method, args)?;
        cx.runtime()
            .interpreter()
            .execute(cx, method, receiver, rest, cx.stay_in_interpreter())
            .map(QuickOutcome::Return)
    }
}

/// Picks the real entry point on first call and installs it.
struct ResolutionStub;

impl QuickCode for ResolutionStub {
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome> {
        if method.is_runtime_method() {
            return Err(VmError::Internal(format!(
                "resolution stub reached for {}",
                method.pretty_method()
            )));
        }
        let aot = if method.ignore_aot_code() {
            None
        } else {
            cx.runtime().linker().aot_quick_code_for(method.addr())
        };
        let code = aot.unwrap_or(if method.is_native() {
            stubs::QUICK_GENERIC_JNI_STUB
        } else {
            stubs::QUICK_TO_INTERPRETER_BRIDGE
        });
        method.set_entry_point_from_quick_compiled_code(code);
        cx.runtime().stubs().resolve(code)?.call(cx, method, args)
    }
}

/// Calls the function in a native method's native slot.
struct GenericJniStub;

impl QuickCode for GenericJniStub {
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome> {
        let native = method.entry_point_from_jni().ok_or_else(|| {
            VmError::illegal_state(format!("no native code for {}", method.pretty_method()))
        })?;
        cx.runtime().stubs().resolve(native)?.call(cx, method, args)
    }
}

/// Native slot of an unregistered native method.
struct DlsymLookupStub;

impl QuickCode for DlsymLookupStub {
    fn call(&self, _cx: &InvokeContext<'_>, method: &MethodRef, _args: &[Value]) -> VmResult<QuickOutcome> {
        Err(VmError::UnsatisfiedLink(format!(
            "No implementation found for {}",
            method.pretty_method()
        )))
    }
}

// =============================================================================
// Tests
// =============================================================================
