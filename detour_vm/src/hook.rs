//! Live method hooking.
//!
//! # Install sequence
//!
//! ```text
//! enable_hook(target)
//! ├── reject backups, no-op on already redirected targets
//! ├── backup = copy of target in the loader's arena (HOOK_BACKUP)
//! ├── descriptor = (reflected backup, additional info, backup)
//! └── ScopedWorldStop
//!     ├── drop cached call sites resolving to target
//!     ├── move target's JIT code to backup
//!     ├── target: descriptor in native slot, trampoline entry,
//!     │           no code item, HOOK_REDIRECTED
//!     └── rewrite every thread's frames target -> backup
//! ```
//!
//! After install the target keeps its identity: vtable slots, call sites and
//! reflective handles all still name it, but every call lands in the
//! [`HookTrampoline`], which hands it to the registered [`HookCallback`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use detour_core::{ObjectRef, Throwable, Value, VmError, VmResult, fatal, stubs};
use detour_jit::Jit;
use detour_runtime::{AccessFlags, HookDescriptor, MethodKind, MethodRef, ReflectedMethod};
use tracing::{debug, info};

use crate::entrypoints::{InvokeContext, QuickCode, QuickOutcome, split_receiver};
use crate::rewriter;
use crate::runtime::Runtime;
use crate::thread::ManagedThread;

// =============================================================================
// Callback
// =============================================================================

/// One intercepted call.
pub struct HookedCall<'a> {
    hooked: &'a MethodRef,
    descriptor: &'a HookDescriptor,
    receiver: Option<&'a Value>,
    args: &'a [Value],
}

impl<'a> HookedCall<'a> {
    /// The redirected method that was called.
    #[inline]
    pub fn hooked_method(&self) -> &'a MethodRef {
        self.hooked
    }

    /// Reflective handle to the backup.
    #[inline]
    pub fn backup(&self) -> &'a Arc<ReflectedMethod> {
        self.descriptor.reflected_method()
    }

    /// Object supplied when the hook was installed.
    #[inline]
    pub fn additional_info(&self) -> &'a ObjectRef {
        self.descriptor.additional_info()
    }

    /// Receiver, `None` for static methods.
    #[inline]
    pub fn receiver(&self) -> Option<&'a Value> {
        self.receiver
    }

    /// Declared arguments.
    #[inline]
    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    /// Call the original behaviour with the intercepted arguments.
    pub fn invoke_original(&self, cx: &InvokeContext<'_>) -> VmResult<Value> {
        cx.invoke_reflected(self.backup(), self.receiver, self.args)
    }
}

/// Receives every call to a redirected method.
pub trait HookCallback: Send + Sync {
    /// Produce the result of `call`.
    fn handle_hooked_method(&self, cx: &InvokeContext<'_>, call: &HookedCall<'_>) -> VmResult<Value>;
}

impl<F> HookCallback for F
where
    F: Fn(&InvokeContext<'_>, &HookedCall<'_>) -> VmResult<Value> + Send + Sync,
{
    #[inline]
    fn handle_hooked_method(&self, cx: &InvokeContext<'_>, call: &HookedCall<'_>) -> VmResult<Value> {
        self(cx, call)
    }
}

/// Process-wide slot for the hook callback. Set once.
#[derive(Default)]
pub struct HookBridge {
    callback: OnceLock<Arc<dyn HookCallback>>,
}

impl HookBridge {
    /// Empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback.
    pub fn register(&self, callback: Arc<dyn HookCallback>) -> VmResult<()> {
        self.callback
            .set(callback)
            .map_err(|_| VmError::illegal_state("hook callback already registered"))
    }

    /// The callback, if registered.
    #[inline]
    pub fn callback(&self) -> Option<&Arc<dyn HookCallback>> {
        self.callback.get()
    }

    /// Check if a callback is registered.
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.callback.get().is_some()
    }
}

impl fmt::Debug for HookBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBridge")
            .field("registered", &self.is_registered())
            .finish()
    }
}

// =============================================================================
// Trampoline
// =============================================================================

/// Code at the hook trampoline address.
pub(crate) struct HookTrampoline {
    bridge: Arc<HookBridge>,
}

impl HookTrampoline {
    pub(crate) fn new(bridge: Arc<HookBridge>) -> Self {
        Self { bridge }
    }
}

impl QuickCode for HookTrampoline {
    fn call(&self, cx: &InvokeContext<'_>, method: &MethodRef, args: &[Value]) -> VmResult<QuickOutcome> {
        let descriptor = method.hook_descriptor().ok_or_else(|| {
            VmError::illegal_state(format!("{} reached the hook trampoline unhooked", method.pretty_method()))
        })?;
        let callback = self
            .bridge
            .callback()
            .ok_or_else(|| VmError::illegal_state("no hook callback registered"))?;
        let (receiver, rest) = split_receiver(method, args)?;
        let call = HookedCall {
            hooked: method,
            descriptor: &descriptor,
            receiver,
            args: rest,
        };
        callback.handle_hooked_method(cx, &call).map(QuickOutcome::Return)
    }
}

// =============================================================================
// Installer
// =============================================================================

impl Runtime {
    /// Register the process-wide hook callback.
    pub fn register_hook_callback(&self, callback: Arc<dyn HookCallback>) -> VmResult<()> {
        self.hook_bridge().register(callback)
    }

    /// Register a closure as the hook callback.
    pub fn set_hook_handler<F>(&self, handler: F) -> VmResult<()>
    where
        F: Fn(&InvokeContext<'_>, &HookedCall<'_>) -> VmResult<Value> + Send + Sync + 'static,
    {
        self.register_hook_callback(Arc::new(handler))
    }

    /// Redirect every future call to `target` through the hook callback.
    ///
    /// Installing twice is a no-op. Backups cannot be hooked.
    pub fn enable_hook(&self, thread: &ManagedThread, target: &MethodRef, additional_info: ObjectRef) -> VmResult<()> {
        match target.kind() {
            MethodKind::HookRedirected => {
                debug!(method = %target.pretty_method(), "already hooked");
                return Ok(());
            }
            MethodKind::HookBackup => {
                return Err(VmError::illegal_argument(format!(
                    "Cannot hook the method backup: {}",
                    target.pretty_method()
                )));
            }
            MethodKind::Original => {}
        }
        if target.is_runtime_method() {
            return Err(VmError::illegal_argument(format!(
                "Cannot hook a runtime method: {}",
                target.pretty_method()
            )));
        }
        let class = target.declaring_class().ok_or_else(|| {
            VmError::illegal_state(format!("{} has no declaring class", target.pretty_method()))
        })?;

        let linker = self.linker();
        let arena = linker.allocator_for_class_loader(class.class_loader());
        let backup = linker.create_runtime_method(&arena);
        backup.copy_from(target, self.jit().map(Jit::code_cache));
        backup.add_access_flags(AccessFlags::HOOK_BACKUP);

        let reflected = Arc::new(ReflectedMethod::from_method(backup.clone()).with_accessible(true));
        let descriptor = arena.alloc_hook_descriptor(
            HookDescriptor::new(reflected, additional_info, backup.clone()),
            linker.image_pointer_size(),
        );

        let world = self.stop_the_world(thread, "enable_hook");
        if target.is_hook_redirected() {
            debug!(method = %target.pretty_method(), "hooked concurrently, backup discarded");
            return Ok(());
        }

        let invalidated = linker.invalidate_callers_for_method(target);
        let migrated = match self.jit() {
            Some(jit) => {
                let cache = jit.code_cache();
                let moved = cache.move_obsolete_method(target.addr(), backup.addr());
                if cache.contains_method(target.addr()) {
                    fatal!("{} still owns JIT code after migration", target.pretty_method());
                }
                moved
            }
            None => 0,
        };

        target.set_hook_descriptor(descriptor);
        target.set_entry_point_from_quick_compiled_code(stubs::QUICK_HOOK_TRAMPOLINE);
        target.set_code_item_offset(0);
        target.set_access_flags(
            (target.access_flags() - AccessFlags::REDIRECT_CLEARED) | AccessFlags::HOOK_REDIRECTED,
        );

        let rewritten = rewriter::replace_method_on_all_stacks(
            &world,
            self.threads(),
            self.instrumentation(),
            target,
            &backup,
        );
        drop(world);

        info!(
            method = %target.pretty_method(),
            backup = %backup.addr(),
            invalidated,
            migrated,
            rewritten,
            "hook installed"
        );
        Ok(())
    }

    /// [`enable_hook`](Self::enable_hook) through a reflective handle, with
    /// failures surfaced as managed exceptions.
    pub fn hook_method(
        &self,
        thread: &ManagedThread,
        handle: &ReflectedMethod,
        additional_info: ObjectRef,
    ) -> Result<(), Throwable> {
        self.enable_hook(thread, handle.method(), additional_info)
            .map_err(|err| err.to_throwable())
    }
}

// =============================================================================
// Tests
// =============================================================================
