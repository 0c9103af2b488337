//! The runtime instance and its code-location queries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use detour_core::{CodeAddress, VmError, VmResult, fatal, stubs};
use detour_gc::Heap;
use detour_jit::{Jit, MethodHeader};
use detour_runtime::{ClassLinker, MethodRecord, MethodRef};
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::entrypoints::{QuickCode, StubTable};
use crate::hook::HookBridge;
use crate::instrumentation::Instrumentation;
use crate::interpreter::{DebuggerPolicy, Interpreter, NoDebugger, TableInterpreter};
use crate::safepoint::{SafepointStats, ScopedWorldStop};
use crate::thread::{ManagedThread, ThreadState};
use crate::thread_list::ThreadList;

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    interpreter: Option<Arc<dyn Interpreter>>,
    debugger: Arc<dyn DebuggerPolicy>,
}

impl RuntimeBuilder {
    /// Use `interpreter` instead of an empty [`TableInterpreter`].
    pub fn with_interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// Use `debugger` instead of [`NoDebugger`].
    pub fn with_debugger(mut self, debugger: Arc<dyn DebuggerPolicy>) -> Self {
        self.debugger = debugger;
        self
    }

    /// Build the runtime. It is not started.
    pub fn build(self) -> Runtime {
        let config = self.config;
        let hook_bridge = Arc::new(HookBridge::new());
        let jit = config.jit.clone().map(Jit::new);
        Runtime {
            linker: ClassLinker::with_arena_capacity(config.pointer_size, config.arena_initial_capacity),
            heap: Heap::new(config.gc.clone()),
            jit,
            threads: ThreadList::new(),
            stubs: StubTable::with_runtime_stubs(Arc::clone(&hook_bridge)),
            instrumentation: Instrumentation::new(config.interpret_only),
            interpreter: self
                .interpreter
                .unwrap_or_else(|| Arc::new(TableInterpreter::new())),
            debugger: self.debugger,
            hook_bridge,
            safepoint_stats: SafepointStats::new(),
            started: AtomicBool::new(false),
            config,
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// One runtime instance.
pub struct Runtime {
    config: RuntimeConfig,
    linker: ClassLinker,
    heap: Heap,
    jit: Option<Jit>,
    threads: ThreadList,
    stubs: StubTable,
    instrumentation: Instrumentation,
    interpreter: Arc<dyn Interpreter>,
    debugger: Arc<dyn DebuggerPolicy>,
    hook_bridge: Arc<HookBridge>,
    safepoint_stats: SafepointStats,
    started: AtomicBool,
}

impl Runtime {
    /// Start building a runtime.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            interpreter: None,
            debugger: Arc::new(NoDebugger),
        }
    }

    /// Runtime with the default interpreter and no debugger.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder(config).build()
    }

    /// Mark the runtime started. Until then every call is interpreted.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            info!(
                jit = self.jit.is_some(),
                interpret_only = self.config.interpret_only,
                "runtime started"
            );
        }
    }

    /// Check if [`start`](Self::start) ran.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Class linker.
    #[inline]
    pub fn linker(&self) -> &ClassLinker {
        &self.linker
    }

    /// Heap.
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// JIT, if configured.
    #[inline]
    pub fn jit(&self) -> Option<&Jit> {
        self.jit.as_ref()
    }

    /// Attached threads.
    #[inline]
    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    /// Code at entry-point addresses.
    #[inline]
    pub fn stubs(&self) -> &StubTable {
        &self.stubs
    }

    /// Entry/exit instrumentation.
    #[inline]
    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Interpreter.
    #[inline]
    pub fn interpreter(&self) -> &dyn Interpreter {
        self.interpreter.as_ref()
    }

    /// Debugger policy.
    #[inline]
    pub fn debugger(&self) -> &dyn DebuggerPolicy {
        self.debugger.as_ref()
    }

    /// Hook callback slot.
    #[inline]
    pub fn hook_bridge(&self) -> &HookBridge {
        &self.hook_bridge
    }

    /// World-stop timing.
    #[inline]
    pub fn safepoint_stats(&self) -> &SafepointStats {
        &self.safepoint_stats
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Attach the calling OS thread.
    pub fn attach_thread(&self, name: &str) -> Arc<ManagedThread> {
        self.threads.attach(name, self.config.stack_frame_limit)
    }

    /// Detach a thread.
    pub fn detach_thread(&self, thread: &ManagedThread) {
        self.threads.detach(thread);
    }

    /// Stop every other thread until the returned guard drops.
    pub fn stop_the_world<'a>(&'a self, requester: &'a ManagedThread, reason: &'static str) -> ScopedWorldStop<'a> {
        debug_assert_ne!(requester.state(), ThreadState::AtSafepoint);
        ScopedWorldStop::new(
            &self.threads,
            self.jit.as_ref(),
            &self.heap,
            &self.safepoint_stats,
            requester,
            reason,
        )
    }

    // =========================================================================
    // Code Installation
    // =========================================================================

    /// Commit `code` to the JIT cache for `method` and make it the method's
    /// entry point.
    ///
    /// The hook check and the entry-point store both happen under the
    /// compilation ticket, so they cannot interleave with a hook install.
    pub fn install_compiled_code(
        &self,
        method: &MethodRecord,
        code_size: usize,
        code: Arc<dyn QuickCode>,
    ) -> VmResult<CodeAddress> {
        let jit = self
            .jit
            .as_ref()
            .ok_or_else(|| VmError::illegal_state("no JIT configured"))?;
        let commit = jit.begin_commit()?;
        reject_hooked(method, "install compiled code for")?;
        let entry = commit.commit(method.addr(), code_size, 0)?;
        let address = entry.entry_point();
        self.stubs.register(address, code);
        method.set_entry_point_from_quick_compiled_code(address);
        drop(commit);
        debug!(method = %method.pretty_method(), %address, code_size, "compiled code installed");
        Ok(address)
    }

    /// Record AOT code at `code_start` for `method` and make it the method's
    /// entry point.
    pub fn install_aot_code(
        &self,
        method: &MethodRecord,
        code_start: CodeAddress,
        code_size: usize,
        code: Arc<dyn QuickCode>,
    ) -> VmResult<()> {
        reject_hooked(method, "install AOT code for")?;
        if stubs::is_runtime_stub(code_start) || self.jit.as_ref().is_some_and(|j| j.contains_pc(code_start)) {
            return Err(VmError::illegal_argument(format!(
                "{code_start} is reserved for runtime code"
            )));
        }
        let header = MethodHeader {
            method: method.addr(),
            code_start,
            code_size,
            frame_size: 0,
        };
        self.linker.register_aot_code(method, header);
        self.stubs.register(code_start, code);
        method.set_entry_point_from_quick_compiled_code(code_start);
        Ok(())
    }

    /// Make `code` callable at `address` as a native implementation.
    pub fn register_native_code(&self, address: CodeAddress, code: Arc<dyn QuickCode>) -> VmResult<()> {
        if stubs::is_runtime_stub(address) || address.is_null() {
            return Err(VmError::illegal_argument(format!(
                "{address} is reserved for runtime code"
            )));
        }
        self.stubs.register(address, code);
        Ok(())
    }

    // =========================================================================
    // Code Queries
    // =========================================================================

    /// Header of the code containing `pc`, if that code belongs to `method`.
    ///
    /// A `pc` of zero names a downcall and is only meaningful for native
    /// methods.
    pub fn method_header_for_pc(&self, method: &MethodRecord, pc: CodeAddress) -> VmResult<Option<MethodHeader>> {
        if method.is_runtime_method() {
            return Ok(None);
        }
        if pc.is_null() && !method.is_native() {
            return Err(VmError::illegal_argument(format!(
                "pc 0 is only valid for native methods: {}",
                method.pretty_method()
            )));
        }

        let entry = method.entry_point_from_quick_compiled_code();
        if entry.is_null() || entry == stubs::QUICK_GENERIC_JNI_STUB || entry == stubs::QUICK_HOOK_TRAMPOLINE {
            return Ok(None);
        }
        if entry != stubs::QUICK_RESOLUTION_STUB && entry != stubs::QUICK_TO_INTERPRETER_BRIDGE {
            if let Some(header) = self.header_for_entry_point(method, entry) {
                if header.contains(pc.raw()) {
                    return Ok(Some(header));
                }
            }
        }

        if let Some(jit) = &self.jit {
            if let Some(header) = jit.code_cache().lookup_method_header(pc, method.addr()) {
                return Ok(Some(header));
            }
            if jit.contains_pc(pc) {
                fatal!(
                    "pc {} in the JIT code cache does not belong to {}",
                    pc,
                    method.pretty_method()
                );
            }
        }

        let Some(header) = self.linker.aot_method_header(method.addr()) else {
            return Ok(None);
        };
        if pc.is_null() || header.contains(pc.raw()) {
            Ok(Some(header))
        } else {
            Ok(None)
        }
    }

    fn header_for_entry_point(&self, method: &MethodRecord, entry: CodeAddress) -> Option<MethodHeader> {
        if let Some(jit) = &self.jit {
            if let Some(compiled) = jit.code_cache().find_by_pc(entry) {
                return (compiled.method() == method.addr()).then(|| *compiled.header());
            }
        }
        self.linker
            .aot_method_header(method.addr())
            .filter(|h| h.entry_point() == entry)
    }

    /// Check if `method` has compiled code anywhere.
    pub fn has_any_compiled_code(&self, method: &MethodRecord) -> bool {
        if self.jit.as_ref().is_some_and(|j| j.code_cache().contains_method(method.addr())) {
            return true;
        }
        !method.ignore_aot_code() && self.linker.aot_method_header(method.addr()).is_some()
    }

    /// Discard compiled code for `method` and route it through the
    /// interpreter bridge.
    pub fn invalidate_compiled_code(&self, method: &MethodRef) -> VmResult<()> {
        reject_hooked(method, "invalidate compiled code of")?;
        method.set_ignore_aot_code();
        let dropped = match &self.jit {
            Some(jit) => jit.code_cache().invalidate_compiled_code_for(method.addr()),
            None => 0,
        };
        let entry = method.entry_point_from_quick_compiled_code();
        if !entry.is_null() && !stubs::is_runtime_stub(entry) {
            method.set_entry_point_from_quick_compiled_code(if method.is_native() {
                stubs::QUICK_GENERIC_JNI_STUB
            } else {
                stubs::QUICK_TO_INTERPRETER_BRIDGE
            });
        }
        debug!(method = %method.pretty_method(), dropped, "compiled code invalidated");
        Ok(())
    }
}

/// Redirected methods run the hook trampoline; their entry point is not
/// ours to replace.
fn reject_hooked(method: &MethodRecord, action: &str) -> VmResult<()> {
    if method.is_hook_redirected() {
        return Err(VmError::illegal_argument(format!(
            "Cannot {action} a hooked method: {}",
            method.pretty_method()
        )));
    }
    Ok(())
}
