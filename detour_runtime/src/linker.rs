//! Class linker.
//!
//! Owns the per-loader arenas and every defined class, resolves types and
//! methods by dex index, caches resolved call sites, and records AOT code.

use std::sync::Arc;

use dashmap::DashMap;
use detour_core::{CodeAddress, MethodAddr, VmError, VmResult, stubs};
use detour_jit::MethodHeader;
use smallvec::SmallVec;
use tracing::debug;

use crate::arena::{DEFAULT_ARENA_CAPACITY, LinearArena};
use crate::class::ClassRecord;
use crate::dex::{DexFile, NO_INDEX, descriptor_to_dot};
use crate::flags::AccessFlags;
use crate::method::{MethodRecord, MethodRef};
use crate::{ClassLoaderId, PointerSize};

const PRIMITIVE_DESCRIPTORS: &str = "VZBCSIJFD";

// =============================================================================
// Definitions
// =============================================================================

/// Method as declared in a class definition.
#[derive(Debug, Clone, Copy)]
pub struct MethodDef {
    /// Index of the method id in the class's dex file.
    pub dex_method_index: u32,
    /// Declared access flags.
    pub access_flags: AccessFlags,
    /// Offset of the bytecode body, 0 for none.
    pub code_item_offset: u32,
}

impl MethodDef {
    /// A method without a body.
    pub fn new(dex_method_index: u32, access_flags: AccessFlags) -> Self {
        Self {
            dex_method_index,
            access_flags,
            code_item_offset: 0,
        }
    }

    /// Attach a bytecode body.
    pub fn with_code(mut self, code_item_offset: u32) -> Self {
        self.code_item_offset = code_item_offset;
        self
    }

    fn is_direct(&self) -> bool {
        self.access_flags
            .intersects(AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR)
    }
}

/// A class ready to be defined.
#[derive(Debug, Clone)]
pub struct ClassDef {
    loader: ClassLoaderId,
    dex_file: Arc<DexFile>,
    descriptor: String,
    access_flags: AccessFlags,
    super_class: Option<Arc<ClassRecord>>,
    interfaces: Vec<Arc<ClassRecord>>,
    methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Start a public class definition.
    pub fn new(loader: ClassLoaderId, dex_file: Arc<DexFile>, descriptor: impl Into<String>) -> Self {
        Self {
            loader,
            dex_file,
            descriptor: descriptor.into(),
            access_flags: AccessFlags::PUBLIC,
            super_class: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Set class access flags.
    pub fn with_access_flags(mut self, flags: AccessFlags) -> Self {
        self.access_flags = flags;
        self
    }

    /// Set the super class.
    pub fn with_super_class(mut self, super_class: &Arc<ClassRecord>) -> Self {
        self.super_class = Some(Arc::clone(super_class));
        self
    }

    /// Add a directly implemented interface.
    pub fn with_interface(mut self, interface: &Arc<ClassRecord>) -> Self {
        self.interfaces.push(Arc::clone(interface));
        self
    }

    /// Declare a method.
    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CallSiteKey {
    caller: MethodAddr,
    dex_pc: u32,
}

// =============================================================================
// Class Linker
// =============================================================================

/// The class-loading and linking collaborator.
#[derive(Debug)]
pub struct ClassLinker {
    pointer_size: PointerSize,
    arena_initial_capacity: usize,
    arenas: DashMap<ClassLoaderId, Arc<LinearArena>>,
    classes: DashMap<(ClassLoaderId, String), Arc<ClassRecord>>,
    call_sites: DashMap<CallSiteKey, MethodRef>,
    aot_code: DashMap<MethodAddr, MethodHeader>,
}

impl ClassLinker {
    /// Create a linker for an image with the given pointer width.
    pub fn new(pointer_size: PointerSize) -> Self {
        Self::with_arena_capacity(pointer_size, DEFAULT_ARENA_CAPACITY)
    }

    /// Create a linker whose arenas start at `arena_initial_capacity` bytes.
    pub fn with_arena_capacity(pointer_size: PointerSize, arena_initial_capacity: usize) -> Self {
        Self {
            pointer_size,
            arena_initial_capacity,
            arenas: DashMap::new(),
            classes: DashMap::new(),
            call_sites: DashMap::new(),
            aot_code: DashMap::new(),
        }
    }

    /// Pointer width of the image.
    #[inline]
    pub fn image_pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Arena owned by `loader`, created on first use.
    pub fn allocator_for_class_loader(&self, loader: ClassLoaderId) -> Arc<LinearArena> {
        self.arenas
            .entry(loader)
            .or_insert_with(|| Arc::new(LinearArena::new(loader, self.arena_initial_capacity)))
            .clone()
    }

    /// Allocate a runtime method from `arena`.
    ///
    /// The record has no dex identity and enters through the resolution stub
    /// until its fields are overwritten.
    pub fn create_runtime_method(&self, arena: &LinearArena) -> MethodRef {
        let method = arena.alloc_method(self.pointer_size);
        method.set_access_flags(AccessFlags::RUNTIME_METHOD);
        method.set_dex_method_index(NO_INDEX);
        method.set_entry_point_from_quick_compiled_code(stubs::QUICK_RESOLUTION_STUB);
        method
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Define and link a class.
    pub fn define_class(&self, def: ClassDef) -> VmResult<Arc<ClassRecord>> {
        let key = (def.loader, def.descriptor.clone());
        if self.classes.contains_key(&key) {
            return Err(VmError::illegal_state(format!(
                "class {} already defined by {}",
                descriptor_to_dot(&def.descriptor),
                def.loader
            )));
        }
        if let Some(super_class) = &def.super_class {
            if super_class.is_interface() {
                return Err(VmError::IncompatibleClassChange(format!(
                    "{} has interface {} as super class",
                    descriptor_to_dot(&def.descriptor),
                    super_class.pretty_name()
                )));
            }
        }
        if let Some(iface) = def.interfaces.iter().find(|i| !i.is_interface()) {
            return Err(VmError::IncompatibleClassChange(format!(
                "{} implements non-interface {}",
                descriptor_to_dot(&def.descriptor),
                iface.pretty_name()
            )));
        }

        let iftable = Self::build_iftable(&def);
        let arena = self.allocator_for_class_loader(def.loader);
        let mut direct = Vec::new();
        let mut virtuals = Vec::new();
        for method_def in &def.methods {
            let method = arena.alloc_method(self.pointer_size);
            Self::init_method(&method, method_def);
            if method_def.is_direct() {
                direct.push(method);
            } else {
                virtuals.push(method);
            }
        }

        let is_interface = def.access_flags.contains(AccessFlags::INTERFACE);
        let class = Arc::new_cyclic(|weak| {
            for method in direct.iter().chain(&virtuals) {
                method.set_declaring_class(weak.clone());
            }
            ClassRecord::new(
                def.descriptor.clone(),
                def.access_flags,
                def.loader,
                Some(Arc::clone(&def.dex_file)),
                def.super_class.clone(),
                iftable,
                direct,
                virtuals,
            )
        });

        if is_interface {
            for (index, method) in class.virtual_methods().iter().enumerate() {
                method.set_method_index(index as u16);
            }
        } else {
            Self::link_vtable(&class);
        }

        debug!(
            class = %class.pretty_name(),
            loader = %def.loader,
            methods = def.methods.len(),
            vtable = class.vtable_len(),
            "defined class"
        );
        self.classes.insert(key, Arc::clone(&class));
        Ok(class)
    }

    fn init_method(method: &MethodRef, def: &MethodDef) {
        method.set_access_flags(def.access_flags);
        method.set_dex_method_index(def.dex_method_index);
        method.set_code_item_offset(def.code_item_offset);
        method.set_entry_point_from_interpreter(stubs::QUICK_TO_INTERPRETER_BRIDGE);

        let flags = def.access_flags;
        let quick = if flags.contains(AccessFlags::NATIVE) {
            method.set_entry_point_from_jni(stubs::JNI_DLSYM_LOOKUP_STUB);
            stubs::QUICK_GENERIC_JNI_STUB
        } else if def.code_item_offset != 0 {
            stubs::QUICK_TO_INTERPRETER_BRIDGE
        } else {
            CodeAddress::NULL
        };
        method.set_entry_point_from_quick_compiled_code(quick);
    }

    fn build_iftable(def: &ClassDef) -> SmallVec<[Arc<ClassRecord>; 2]> {
        let mut iftable: SmallVec<[Arc<ClassRecord>; 2]> = SmallVec::new();
        let mut push = |iface: &Arc<ClassRecord>| {
            if !iftable.iter().any(|i| Arc::ptr_eq(i, iface)) {
                iftable.push(Arc::clone(iface));
            }
        };
        if let Some(super_class) = &def.super_class {
            super_class.iftable().iter().for_each(&mut push);
        }
        for iface in &def.interfaces {
            iface.iftable().iter().for_each(&mut push);
            push(iface);
        }
        iftable
    }

    fn link_vtable(class: &Arc<ClassRecord>) {
        let mut vtable = class
            .super_class()
            .map(|s| s.vtable())
            .unwrap_or_default();
        for method in class.virtual_methods() {
            let slot = vtable
                .iter()
                .position(|inherited| inherited.has_same_name_and_signature(method));
            match slot {
                Some(index) => {
                    method.set_method_index(index as u16);
                    vtable[index] = method.clone();
                }
                None => {
                    method.set_method_index(vtable.len() as u16);
                    vtable.push(method.clone());
                }
            }
        }
        class.set_vtable(vtable);
    }

    /// Find a defined class, falling back to the boot loader.
    pub fn find_class(&self, loader: ClassLoaderId, descriptor: &str) -> Option<Arc<ClassRecord>> {
        if descriptor.len() == 1 && PRIMITIVE_DESCRIPTORS.contains(descriptor) {
            return Some(self.primitive_class(descriptor));
        }
        self.classes
            .get(&(loader, descriptor.to_owned()))
            .or_else(|| self.classes.get(&(ClassLoaderId::BOOT, descriptor.to_owned())))
            .map(|entry| Arc::clone(entry.value()))
    }

    fn primitive_class(&self, descriptor: &str) -> Arc<ClassRecord> {
        self.classes
            .entry((ClassLoaderId::BOOT, descriptor.to_owned()))
            .or_insert_with(|| Arc::new(ClassRecord::primitive(descriptor)))
            .clone()
    }

    /// Number of defined classes, primitives included once resolved.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve a type index in the context of `referrer`'s dex file.
    pub fn resolve_type(&self, type_idx: u16, referrer: &MethodRecord) -> VmResult<Arc<ClassRecord>> {
        let class = referrer
            .declaring_class()
            .ok_or_else(|| VmError::illegal_state("referrer has no declaring class"))?;
        let dex = class
            .dex_file()
            .ok_or_else(|| VmError::illegal_state("referrer has no dex file"))?;
        let descriptor = dex
            .type_descriptor(type_idx)
            .ok_or_else(|| VmError::NoClassDefFound(format!("type index {type_idx}")))?;
        self.find_class(class.class_loader(), descriptor)
            .ok_or_else(|| VmError::NoClassDefFound(descriptor_to_dot(descriptor)))
    }

    /// Resolve a method index in the context of `referrer`'s dex file.
    pub fn resolve_method(&self, method_idx: u32, referrer: &MethodRecord) -> VmResult<MethodRef> {
        let class = referrer
            .declaring_class()
            .ok_or_else(|| VmError::illegal_state("referrer has no declaring class"))?;
        let dex = class
            .dex_file()
            .ok_or_else(|| VmError::illegal_state("referrer has no dex file"))?;
        let method_id = dex
            .method_id(method_idx)
            .ok_or_else(|| VmError::illegal_argument(format!("method index {method_idx}")))?;
        let holder = self.resolve_type(method_id.class_idx, referrer)?;
        let name = dex.method_name(method_idx).unwrap_or_default();
        let signature = dex.method_signature(method_idx).unwrap_or_default();
        holder.find_method(name, &signature).ok_or_else(|| {
            VmError::IncompatibleClassChange(format!(
                "no method {}.{name}{signature}",
                holder.pretty_name()
            ))
        })
    }

    // =========================================================================
    // Call Sites
    // =========================================================================

    /// Resolve the method called by `caller` at `dex_pc`, caching the result.
    pub fn resolve_call_site(&self, caller: &MethodRef, dex_pc: u32, method_idx: u32) -> VmResult<MethodRef> {
        let key = CallSiteKey {
            caller: caller.addr(),
            dex_pc,
        };
        if let Some(cached) = self.call_sites.get(&key) {
            return Ok(cached.clone());
        }
        let resolved = self.resolve_method(method_idx, caller)?;
        self.call_sites.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Cached resolution for a call site.
    pub fn cached_call_site(&self, caller: MethodAddr, dex_pc: u32) -> Option<MethodRef> {
        self.call_sites
            .get(&CallSiteKey { caller, dex_pc })
            .map(|entry| entry.value().clone())
    }

    /// Drop every cached call site resolved to `method`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_callers_for_method(&self, method: &MethodRecord) -> usize {
        let target = method.addr();
        let before = self.call_sites.len();
        self.call_sites.retain(|_, resolved| resolved.addr() != target);
        let removed = before - self.call_sites.len();
        debug!(method = %method.pretty_method(), removed, "invalidated call sites");
        removed
    }

    /// Number of cached call sites.
    pub fn call_site_count(&self) -> usize {
        self.call_sites.len()
    }

    // =========================================================================
    // AOT Code
    // =========================================================================

    /// Record AOT-compiled code for `method` and enter through it unless the
    /// method ignores AOT code.
    pub fn register_aot_code(&self, method: &MethodRecord, header: MethodHeader) {
        self.aot_code.insert(method.addr(), header);
        if !method.ignore_aot_code() {
            method.set_entry_point_from_quick_compiled_code(header.entry_point());
        }
    }

    /// AOT method header for `method`.
    pub fn aot_method_header(&self, method: MethodAddr) -> Option<MethodHeader> {
        self.aot_code.get(&method).map(|entry| *entry.value())
    }

    /// Entry point of the AOT code for `method`.
    pub fn aot_quick_code_for(&self, method: MethodAddr) -> Option<CodeAddress> {
        self.aot_method_header(method).map(|h| h.entry_point())
    }
}
