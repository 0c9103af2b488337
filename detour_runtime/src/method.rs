//! Method records.
//!
//! A [`MethodRecord`] is the runtime descriptor of one loaded method. Its
//! address is its identity: vtables, interface tables, call-site caches and
//! the JIT code cache all store that address, so a record is never moved or
//! replaced. Hooking mutates a record in place.
//!
//! # Entry points
//!
//! ```text
//! quick_code        compiled code, a stub, or NULL (no executable body)
//! native_slot       native implementation, or the HookDescriptor once redirected
//! interpreter_entry bridge used when the call must run interpreted
//! ```
//!
//! Slots are atomics so lock-free readers never see torn values. Writers
//! other than the class linker run inside a stop-the-world window.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use detour_core::{CodeAddress, MethodAddr, VmError, VmResult, fatal, stubs};
use detour_jit::{CodeCache, ProfilingInfo};
use parking_lot::RwLock;
use tracing::warn;

use crate::class::ClassRecord;
use crate::dex::{CodeItem, DexFile, NO_INDEX, descriptor_to_dot, opcodes, pretty_descriptor};
use crate::flags::{AccessFlags, MethodKind};
use crate::linker::ClassLinker;
use crate::reflect::HookDescriptor;
use crate::{InvokeType, PointerSize};

// =============================================================================
// Native Slot
// =============================================================================

/// Contents of the native-call entry slot.
#[derive(Debug, Clone, Default)]
pub enum NativeSlot {
    /// Nothing registered.
    #[default]
    Empty,
    /// Native implementation (or the dlsym lookup stub).
    Native(CodeAddress),
    /// Hook metadata of a redirected method.
    Hook(Arc<HookDescriptor>),
}

// =============================================================================
// Method Record
// =============================================================================

/// One resolved method of a loaded class.
pub struct MethodRecord {
    declaring_class: RwLock<Weak<ClassRecord>>,
    access_flags: AtomicU32,
    dex_method_index: AtomicU32,
    /// Vtable index for virtual methods, interface-method index for
    /// interface methods.
    method_index: AtomicU16,
    code_item_offset: AtomicU32,
    hotness: AtomicU16,
    quick_code: AtomicUsize,
    interpreter_entry: AtomicUsize,
    native_slot: RwLock<NativeSlot>,
    profiling_info: RwLock<Option<Arc<ProfilingInfo>>>,
}

/// A located catch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchBlock {
    /// Dex pc of the handler.
    pub handler_pc: u32,
    /// The handler does not start with `move-exception`.
    pub has_no_move_exception: bool,
}

impl MethodRecord {
    /// A blank record, as handed out by the arena.
    pub(crate) fn uninit() -> Self {
        Self {
            declaring_class: RwLock::new(Weak::new()),
            access_flags: AtomicU32::new(0),
            dex_method_index: AtomicU32::new(NO_INDEX),
            method_index: AtomicU16::new(0),
            code_item_offset: AtomicU32::new(0),
            hotness: AtomicU16::new(0),
            quick_code: AtomicUsize::new(0),
            interpreter_entry: AtomicUsize::new(0),
            native_slot: RwLock::new(NativeSlot::Empty),
            profiling_info: RwLock::new(None),
        }
    }

    /// Bytes a record occupies in an image with the given pointer width.
    pub const fn size(pointer_size: PointerSize) -> usize {
        // Five 32-bit words plus two 16-bit counters, padded to pointer
        // alignment, then the pointer-sized slots.
        let fixed: usize = 20;
        let ps = pointer_size.bytes();
        fixed.next_multiple_of(ps) + 4 * ps
    }

    /// Identity of this record.
    #[inline]
    pub fn addr(&self) -> MethodAddr {
        MethodAddr(self as *const Self as usize)
    }

    // =========================================================================
    // Copy
    // =========================================================================

    /// Turn this freshly allocated record into a standalone copy of `src`.
    ///
    /// Every field is duplicated, then the fields that must not alias `src`
    /// are fixed up: an entry point inside the live JIT code cache becomes
    /// the interpreter bridge, profiling data is dropped unless `src` is
    /// native, and the hotness counter restarts at zero.
    pub fn copy_from(&self, src: &MethodRecord, code_cache: Option<&CodeCache>) {
        self.access_flags.store(src.access_flags.load(Ordering::Relaxed), Ordering::Relaxed);
        self.dex_method_index
            .store(src.dex_method_index.load(Ordering::Relaxed), Ordering::Relaxed);
        self.method_index
            .store(src.method_index.load(Ordering::Relaxed), Ordering::Relaxed);
        self.code_item_offset
            .store(src.code_item_offset.load(Ordering::Relaxed), Ordering::Relaxed);
        self.quick_code
            .store(src.quick_code.load(Ordering::Acquire), Ordering::Release);
        self.interpreter_entry
            .store(src.interpreter_entry.load(Ordering::Acquire), Ordering::Release);
        *self.native_slot.write() = src.native_slot.read().clone();
        *self.profiling_info.write() = src.profiling_info.read().clone();

        // The destination started blank; its class slot is set explicitly.
        *self.declaring_class.write() = src.declaring_class.read().clone();

        if let Some(cache) = code_cache {
            if cache.contains_pc(self.entry_point_from_quick_compiled_code()) {
                self.set_entry_point_from_quick_compiled_code(stubs::QUICK_TO_INTERPRETER_BRIDGE);
            }
        }
        if !src.is_native() {
            self.set_profiling_info(None);
        }
        self.hotness.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Class & Dex Data
    // =========================================================================

    /// Declaring class, if linked and alive.
    pub fn declaring_class(&self) -> Option<Arc<ClassRecord>> {
        self.declaring_class.read().upgrade()
    }

    pub(crate) fn set_declaring_class(&self, class: Weak<ClassRecord>) {
        *self.declaring_class.write() = class;
    }

    /// Dex file of the declaring class.
    pub fn dex_file(&self) -> Option<Arc<DexFile>> {
        self.declaring_class()?.dex_file().cloned()
    }

    /// Index of the method id in the dex file.
    #[inline]
    pub fn dex_method_index(&self) -> u32 {
        self.dex_method_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dex_method_index(&self, idx: u32) {
        self.dex_method_index.store(idx, Ordering::Relaxed);
    }

    /// Vtable (or interface-method) index.
    #[inline]
    pub fn method_index(&self) -> u16 {
        self.method_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_method_index(&self, idx: u16) {
        self.method_index.store(idx, Ordering::Relaxed);
    }

    /// Offset of the bytecode body, 0 when there is none.
    #[inline]
    pub fn code_item_offset(&self) -> u32 {
        self.code_item_offset.load(Ordering::Relaxed)
    }

    /// Set the bytecode body offset.
    #[inline]
    pub fn set_code_item_offset(&self, offset: u32) {
        self.code_item_offset.store(offset, Ordering::Relaxed);
    }

    /// Bytecode body.
    pub fn code_item(&self) -> Option<Arc<CodeItem>> {
        match self.code_item_offset() {
            0 => None,
            offset => self.dex_file()?.code_item(offset),
        }
    }

    /// Method name.
    pub fn name(&self) -> Option<String> {
        self.dex_file()?
            .method_name(self.dex_method_index())
            .map(str::to_owned)
    }

    /// Method signature, e.g. `(I)V`.
    pub fn signature(&self) -> Option<String> {
        self.dex_file()?.method_signature(self.dex_method_index())
    }

    /// Method shorty, e.g. `VI`.
    pub fn shorty(&self) -> Option<String> {
        self.dex_file()?
            .method_shorty(self.dex_method_index())
            .map(str::to_owned)
    }

    /// `ReturnType pkg.Class.name(Params)`.
    pub fn pretty_method(&self) -> String {
        let idx = self.dex_method_index();
        if idx == NO_INDEX {
            return "<runtime method>".to_owned();
        }
        let Some(class) = self.declaring_class() else {
            return format!("<unlinked method #{idx}>");
        };
        let Some(dex) = class.dex_file() else {
            return format!("{}.<method #{idx}>", class.pretty_name());
        };
        let (Some(name), Some(proto)) = (dex.method_name(idx), dex.method_proto(idx)) else {
            return format!("{}.<method #{idx}>", class.pretty_name());
        };
        let ret = dex
            .type_descriptor(proto.return_type_idx)
            .map(pretty_descriptor)
            .unwrap_or_default();
        let params: Vec<String> = proto
            .parameters
            .iter()
            .filter_map(|&p| dex.type_descriptor(p).map(pretty_descriptor))
            .collect();
        format!("{ret} {}.{name}({})", class.pretty_name(), params.join(", "))
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Access flags.
    #[inline]
    pub fn access_flags(&self) -> AccessFlags {
        AccessFlags::from_bits_retain(self.access_flags.load(Ordering::Acquire))
    }

    /// Replace the access flags.
    #[inline]
    pub fn set_access_flags(&self, flags: AccessFlags) {
        self.access_flags.store(flags.bits(), Ordering::Release);
    }

    /// Add flags.
    #[inline]
    pub fn add_access_flags(&self, flags: AccessFlags) {
        self.access_flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    fn has(&self, flag: AccessFlags) -> bool {
        self.access_flags().contains(flag)
    }

    /// `static`.
    #[inline]
    pub fn is_static(&self) -> bool {
        self.has(AccessFlags::STATIC)
    }

    /// `private`.
    #[inline]
    pub fn is_private(&self) -> bool {
        self.has(AccessFlags::PRIVATE)
    }

    /// `native`.
    #[inline]
    pub fn is_native(&self) -> bool {
        self.has(AccessFlags::NATIVE)
    }

    /// Registered for the fast native calling convention.
    #[inline]
    pub fn is_fast_native(&self) -> bool {
        self.has(AccessFlags::FAST_NATIVE)
    }

    /// `abstract`.
    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.has(AccessFlags::ABSTRACT)
    }

    /// `synchronized`.
    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.has(AccessFlags::SYNCHRONIZED)
    }

    /// Constructor.
    #[inline]
    pub fn is_constructor(&self) -> bool {
        self.has(AccessFlags::CONSTRUCTOR)
    }

    /// Default interface method.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.has(AccessFlags::DEFAULT)
    }

    /// Conflicting default methods.
    #[inline]
    pub fn is_default_conflicting(&self) -> bool {
        self.has(AccessFlags::DEFAULT_CONFLICT)
    }

    /// Created by the runtime rather than loaded.
    #[inline]
    pub fn is_runtime_method(&self) -> bool {
        self.has(AccessFlags::RUNTIME_METHOD)
    }

    /// AOT code must be ignored.
    #[inline]
    pub fn ignore_aot_code(&self) -> bool {
        self.has(AccessFlags::SKIP_AOT_CODE)
    }

    /// Stop using AOT code for this method.
    #[inline]
    pub fn set_ignore_aot_code(&self) {
        self.add_access_flags(AccessFlags::SKIP_AOT_CODE);
    }

    /// Preserved pre-hook copy.
    #[inline]
    pub fn is_hook_backup(&self) -> bool {
        self.has(AccessFlags::HOOK_BACKUP)
    }

    /// Redirected to the hook trampoline.
    #[inline]
    pub fn is_hook_redirected(&self) -> bool {
        self.has(AccessFlags::HOOK_REDIRECTED)
    }

    /// Hook kind.
    pub fn kind(&self) -> MethodKind {
        match MethodKind::from_flags(self.access_flags()) {
            Some(kind) => kind,
            None => fatal!("{} is both hook backup and hook redirected", self.pretty_method()),
        }
    }

    /// Static, private or constructor.
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.is_static() || self.is_private() || self.is_constructor()
    }

    /// Neither abstract nor default-conflicting.
    #[inline]
    pub fn is_invokable(&self) -> bool {
        !self.is_abstract() && !self.is_default_conflicting()
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Compiled-code entry point.
    #[inline]
    pub fn entry_point_from_quick_compiled_code(&self) -> CodeAddress {
        CodeAddress(self.quick_code.load(Ordering::Acquire))
    }

    /// Set the compiled-code entry point.
    #[inline]
    pub fn set_entry_point_from_quick_compiled_code(&self, code: CodeAddress) {
        self.quick_code.store(code.raw(), Ordering::Release);
    }

    /// Entry used when the call must run interpreted.
    #[inline]
    pub fn entry_point_from_interpreter(&self) -> CodeAddress {
        CodeAddress(self.interpreter_entry.load(Ordering::Acquire))
    }

    /// Set the interpreter entry.
    #[inline]
    pub fn set_entry_point_from_interpreter(&self, code: CodeAddress) {
        self.interpreter_entry.store(code.raw(), Ordering::Release);
    }

    /// Native implementation, if the slot holds one.
    pub fn entry_point_from_jni(&self) -> Option<CodeAddress> {
        match &*self.native_slot.read() {
            NativeSlot::Native(code) => Some(*code),
            _ => None,
        }
    }

    /// Store a native implementation in the native slot.
    pub fn set_entry_point_from_jni(&self, code: CodeAddress) {
        *self.native_slot.write() = NativeSlot::Native(code);
    }

    /// Raw native slot contents.
    pub fn native_slot(&self) -> NativeSlot {
        self.native_slot.read().clone()
    }

    /// Hook metadata, present once redirected.
    pub fn hook_descriptor(&self) -> Option<Arc<HookDescriptor>> {
        match &*self.native_slot.read() {
            NativeSlot::Hook(descriptor) => Some(Arc::clone(descriptor)),
            _ => None,
        }
    }

    /// Repurpose the native slot for hook metadata.
    pub fn set_hook_descriptor(&self, descriptor: Arc<HookDescriptor>) {
        *self.native_slot.write() = NativeSlot::Hook(descriptor);
    }

    /// The backup of a redirected method.
    pub fn backup_method(&self) -> Option<MethodRef> {
        self.hook_descriptor().map(|d| d.backup_method().clone())
    }

    // =========================================================================
    // Hotness & Profiling
    // =========================================================================

    /// Hotness counter.
    #[inline]
    pub fn hotness_count(&self) -> u16 {
        self.hotness.load(Ordering::Relaxed)
    }

    /// Bump the hotness counter (saturating) and return the new value.
    pub fn increment_hotness(&self) -> u16 {
        let prev = self
            .hotness
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| Some(h.saturating_add(1)))
            .unwrap_or(u16::MAX);
        prev.saturating_add(1)
    }

    /// Profiling data.
    pub fn profiling_info(&self) -> Option<Arc<ProfilingInfo>> {
        self.profiling_info.read().clone()
    }

    /// Replace the profiling data.
    pub fn set_profiling_info(&self, info: Option<Arc<ProfilingInfo>>) {
        *self.profiling_info.write() = info;
    }

    /// Profiling data, created on first use.
    pub fn ensure_profiling_info(&self) -> Arc<ProfilingInfo> {
        let mut slot = self.profiling_info.write();
        Arc::clone(slot.get_or_insert_with(|| Arc::new(ProfilingInfo::new(self.addr()))))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// How call sites dispatch to this method.
    pub fn invoke_type(&self) -> InvokeType {
        if self.is_static() {
            InvokeType::Static
        } else if self.declaring_class().is_some_and(|c| c.is_interface()) {
            InvokeType::Interface
        } else if self.is_direct() || self.is_hook_backup() {
            InvokeType::Direct
        } else {
            InvokeType::Virtual
        }
    }

    /// Argument registers used by a shorty (wide types take two).
    pub fn num_arg_registers(shorty: &str) -> VmResult<usize> {
        let mut chars = shorty.chars();
        if chars.next().is_none() {
            return Err(VmError::illegal_argument("empty shorty"));
        }
        Ok(chars.map(|c| if c == 'J' || c == 'D' { 2 } else { 1 }).sum())
    }

    /// Check if `other` has the same name and signature.
    pub fn has_same_name_and_signature(&self, other: &MethodRecord) -> bool {
        let (Some(dex), Some(other_dex)) = (self.dex_file(), other.dex_file()) else {
            return false;
        };
        let (Some(mid), Some(other_mid)) = (
            dex.method_id(self.dex_method_index()),
            other_dex.method_id(other.dex_method_index()),
        ) else {
            return false;
        };
        if Arc::ptr_eq(&dex, &other_dex) {
            return mid.name_idx == other_mid.name_idx && mid.proto_idx == other_mid.proto_idx;
        }
        dex.string(mid.name_idx) == other_dex.string(other_mid.name_idx)
            && dex.method_signature(self.dex_method_index())
                == other_dex.method_signature(other.dex_method_index())
    }

    /// The super-class or interface method this one overrides.
    pub fn find_overridden_method(&self) -> Option<MethodRef> {
        if self.is_static() {
            return None;
        }
        let class = self.declaring_class()?;
        if let Some(super_class) = class.super_class() {
            if super_class.has_vtable() && usize::from(self.method_index()) < super_class.vtable_len() {
                return super_class.vtable_entry(self.method_index());
            }
        }
        class.iftable().iter().find_map(|iface| {
            iface
                .virtual_methods()
                .iter()
                .find(|m| self.has_same_name_and_signature(m))
                .cloned()
        })
    }

    /// Index of this method in `other`, given the index of a method id in
    /// `other` with the same name and signature.
    pub fn find_dex_method_index_in_other_dex_file(
        &self,
        other: &DexFile,
        name_and_signature_idx: u32,
    ) -> Option<u32> {
        let dex = self.dex_file()?;
        let idx = self.dex_method_index();
        if std::ptr::eq(dex.as_ref(), other) {
            return Some(idx);
        }
        let descriptor = dex.method_declaring_descriptor(idx)?;
        let other_type = other.find_type_id(descriptor)?;
        let name_and_sig = other.method_id(name_and_signature_idx)?;
        other.find_method_id(other_type, name_and_sig.name_idx, name_and_sig.proto_idx)
    }

    /// Compare declared parameter types with `params` by identity.
    pub fn equal_parameters(&self, linker: &ClassLinker, params: &[Arc<ClassRecord>]) -> VmResult<bool> {
        let dex = self
            .dex_file()
            .ok_or_else(|| VmError::illegal_state(format!("{} has no dex file", self.pretty_method())))?;
        let proto = dex.method_proto(self.dex_method_index()).ok_or_else(|| {
            VmError::illegal_state(format!("{} has no prototype", self.pretty_method()))
        })?;
        if proto.parameters.len() != params.len() {
            return Ok(false);
        }
        for (&type_idx, param) in proto.parameters.iter().zip(params) {
            let resolved = linker.resolve_type(type_idx, self)?;
            if !Arc::ptr_eq(&resolved, param) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The error raised when calling a non-invokable method.
    pub fn invocation_time_error(&self) -> VmError {
        // A conflicting method may or may not also be abstract.
        if self.is_default_conflicting() {
            VmError::IncompatibleClassChange(format!(
                "Conflicting default method implementations {}",
                self.pretty_method()
            ))
        } else {
            VmError::AbstractMethod(self.pretty_method())
        }
    }

    /// Find the handler for an exception of type `exception_class` thrown at
    /// `dex_pc`.
    ///
    /// Handlers whose type cannot be resolved are skipped with a warning.
    pub fn find_catch_block(
        &self,
        linker: &ClassLinker,
        exception_class: &ClassRecord,
        dex_pc: u32,
    ) -> Option<CatchBlock> {
        let code = self.code_item()?;
        let mut found = None;
        for handler in code.catch_handlers(dex_pc) {
            let Some(type_idx) = handler.type_idx else {
                found = Some(handler.address);
                break;
            };
            match linker.resolve_type(type_idx, self) {
                Ok(handler_class) => {
                    if handler_class.is_assignable_from(exception_class) {
                        found = Some(handler.address);
                        break;
                    }
                }
                Err(err) => {
                    let descriptor = self
                        .dex_file()
                        .and_then(|dex| dex.type_descriptor(type_idx).map(descriptor_to_dot))
                        .unwrap_or_else(|| format!("<type #{type_idx}>"));
                    warn!(
                        class = %descriptor,
                        error = %err,
                        "Unresolved exception class when finding catch block"
                    );
                }
            }
        }
        found.map(|handler_pc| CatchBlock {
            handler_pc,
            has_no_move_exception: code.opcode_at(handler_pc) != Some(opcodes::MOVE_EXCEPTION),
        })
    }

    // =========================================================================
    // Native Registration
    // =========================================================================

    /// Register a native implementation.
    ///
    /// On a redirected method this registers on the backup.
    pub fn register_native(&self, code: CodeAddress, is_fast: bool) -> VmResult<()> {
        if self.is_hook_redirected() {
            return self.require_backup()?.register_native(code, is_fast);
        }
        if !self.is_native() {
            return Err(VmError::illegal_argument(format!(
                "not a native method: {}",
                self.pretty_method()
            )));
        }
        if self.is_fast_native() {
            return Err(VmError::illegal_argument(format!(
                "already registered as fast native: {}",
                self.pretty_method()
            )));
        }
        if code.is_null() {
            return Err(VmError::illegal_argument(format!(
                "null native code for {}",
                self.pretty_method()
            )));
        }
        if is_fast {
            self.add_access_flags(AccessFlags::FAST_NATIVE);
        }
        self.set_entry_point_from_jni(code);
        Ok(())
    }

    /// Restore the dlsym lookup stub.
    ///
    /// On a redirected method this unregisters the backup.
    pub fn unregister_native(&self) -> VmResult<()> {
        if self.is_hook_redirected() {
            return self.require_backup()?.unregister_native();
        }
        if !self.is_native() || self.is_fast_native() {
            return Err(VmError::illegal_argument(format!(
                "cannot unregister {}",
                self.pretty_method()
            )));
        }
        self.register_native(stubs::JNI_DLSYM_LOOKUP_STUB, false)
    }

    fn require_backup(&self) -> VmResult<MethodRef> {
        self.backup_method().ok_or_else(|| {
            VmError::illegal_state(format!("{} is redirected without a backup", self.pretty_method()))
        })
    }
}

impl fmt::Debug for MethodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRecord")
            .field("addr", &self.addr())
            .field("dex_method_index", &self.dex_method_index())
            .field("access_flags", &self.access_flags())
            .field("quick_code", &self.entry_point_from_quick_compiled_code())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Method Ref
// =============================================================================

/// Shared handle to a method record. Equality and hashing use identity.
#[derive(Clone)]
pub struct MethodRef(Arc<MethodRecord>);

impl MethodRef {
    pub(crate) fn new(record: MethodRecord) -> Self {
        MethodRef(Arc::new(record))
    }

    /// Check if both handles name the same record.
    #[inline]
    pub fn ptr_eq(&self, other: &MethodRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for MethodRef {
    type Target = MethodRecord;

    #[inline]
    fn deref(&self) -> &MethodRecord {
        &self.0
    }
}

impl PartialEq for MethodRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for MethodRef {}

impl Hash for MethodRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodRef({})", self.addr())
    }
}
