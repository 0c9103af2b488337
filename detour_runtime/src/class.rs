//! Loaded classes.
//!
//! A `ClassRecord` owns its method records' handles and the dispatch tables
//! that refer to them:
//!
//! ```text
//! ClassRecord
//! ├── descriptor / access flags / class loader
//! ├── dex_file (None for primitive classes)
//! ├── super_class
//! ├── iftable:          every implemented interface, transitively
//! ├── direct_methods:   static, private and constructors
//! ├── virtual_methods:  everything dispatched through the vtable
//! └── vtable:           MethodRef slots, inherited then overridden/appended
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::dex::{DexFile, pretty_descriptor};
use crate::flags::AccessFlags;
use crate::method::MethodRef;
use crate::ClassLoaderId;

/// A loaded class.
#[derive(Debug)]
pub struct ClassRecord {
    descriptor: String,
    access_flags: AccessFlags,
    loader: ClassLoaderId,
    dex_file: Option<Arc<DexFile>>,
    super_class: Option<Arc<ClassRecord>>,
    iftable: SmallVec<[Arc<ClassRecord>; 2]>,
    direct_methods: Vec<MethodRef>,
    virtual_methods: Vec<MethodRef>,
    vtable: RwLock<Vec<MethodRef>>,
}

impl ClassRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        descriptor: String,
        access_flags: AccessFlags,
        loader: ClassLoaderId,
        dex_file: Option<Arc<DexFile>>,
        super_class: Option<Arc<ClassRecord>>,
        iftable: SmallVec<[Arc<ClassRecord>; 2]>,
        direct_methods: Vec<MethodRef>,
        virtual_methods: Vec<MethodRef>,
    ) -> Self {
        Self {
            descriptor,
            access_flags,
            loader,
            dex_file,
            super_class,
            iftable,
            direct_methods,
            virtual_methods,
            vtable: RwLock::new(Vec::new()),
        }
    }

    /// A primitive class such as `I`, owned by the boot loader.
    pub(crate) fn primitive(descriptor: &str) -> Self {
        Self::new(
            descriptor.to_owned(),
            AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT,
            ClassLoaderId::BOOT,
            None,
            None,
            SmallVec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    /// Type descriptor, e.g. `Lcom/example/Foo;`.
    #[inline]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Dotted name, e.g. `com.example.Foo`.
    pub fn pretty_name(&self) -> String {
        pretty_descriptor(&self.descriptor)
    }

    /// Class access flags.
    #[inline]
    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Check if this is an interface.
    #[inline]
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(AccessFlags::INTERFACE)
    }

    /// Check if this is a primitive class.
    #[inline]
    pub fn is_primitive(&self) -> bool {
        self.dex_file.is_none() && self.descriptor.len() == 1
    }

    /// Defining class loader.
    #[inline]
    pub fn class_loader(&self) -> ClassLoaderId {
        self.loader
    }

    /// Dex file holding the class definition.
    #[inline]
    pub fn dex_file(&self) -> Option<&Arc<DexFile>> {
        self.dex_file.as_ref()
    }

    /// Super class, `None` for roots, interfaces' implicit root and primitives.
    #[inline]
    pub fn super_class(&self) -> Option<&Arc<ClassRecord>> {
        self.super_class.as_ref()
    }

    /// Implemented interfaces, transitively.
    #[inline]
    pub fn iftable(&self) -> &[Arc<ClassRecord>] {
        &self.iftable
    }

    /// Static, private and constructor methods.
    #[inline]
    pub fn direct_methods(&self) -> &[MethodRef] {
        &self.direct_methods
    }

    /// Virtually dispatched methods declared here.
    #[inline]
    pub fn virtual_methods(&self) -> &[MethodRef] {
        &self.virtual_methods
    }

    /// All declared methods, direct first.
    pub fn methods(&self) -> impl Iterator<Item = &MethodRef> {
        self.direct_methods.iter().chain(&self.virtual_methods)
    }

    /// Check if instances dispatch through a vtable.
    #[inline]
    pub fn has_vtable(&self) -> bool {
        !self.is_interface() && !self.is_primitive()
    }

    /// Number of vtable slots.
    pub fn vtable_len(&self) -> usize {
        self.vtable.read().len()
    }

    /// Vtable slot `index`.
    pub fn vtable_entry(&self, index: u16) -> Option<MethodRef> {
        self.vtable.read().get(usize::from(index)).cloned()
    }

    /// Snapshot of the vtable.
    pub fn vtable(&self) -> Vec<MethodRef> {
        self.vtable.read().clone()
    }

    pub(crate) fn set_vtable(&self, vtable: Vec<MethodRef>) {
        *self.vtable.write() = vtable;
    }

    /// Find a method declared here by name and signature.
    pub fn find_declared_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        self.methods()
            .find(|m| m.name().as_deref() == Some(name) && m.signature().as_deref() == Some(signature))
            .cloned()
    }

    /// Find a method here, in super classes, then in implemented interfaces.
    pub fn find_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        let mut class = Some(self);
        while let Some(c) = class {
            if let Some(m) = c.find_declared_method(name, signature) {
                return Some(m);
            }
            class = c.super_class.as_deref();
        }
        self.iftable
            .iter()
            .find_map(|iface| iface.find_declared_method(name, signature))
    }

    /// Check if `self` is `other` or one of its super classes.
    pub fn is_superclass_or_self_of(&self, other: &ClassRecord) -> bool {
        let mut class = Some(other);
        while let Some(c) = class {
            if std::ptr::eq(c, self) {
                return true;
            }
            class = c.super_class.as_deref();
        }
        false
    }

    /// Check if a value of type `other` can be stored in a slot of this type.
    pub fn is_assignable_from(&self, other: &ClassRecord) -> bool {
        if self.is_interface() {
            std::ptr::eq(self, other)
                || other.iftable.iter().any(|iface| std::ptr::eq(iface.as_ref(), self))
        } else {
            self.is_superclass_or_self_of(other)
        }
    }
}
