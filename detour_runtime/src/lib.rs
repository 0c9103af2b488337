//! Method records and their class-linking collaborators.
//!
//! # Architecture
//!
//! ```text
//! ClassLinker
//! ├── arenas:     ClassLoaderId -> LinearArena   (owns every MethodRecord)
//! ├── classes:    (loader, descriptor) -> ClassRecord
//! │                   ├── direct/virtual methods: MethodRef
//! │                   ├── vtable: MethodRef slots
//! │                   └── iftable: implemented interfaces
//! ├── call sites: (caller, dex pc) -> MethodRef
//! └── AOT code:   MethodAddr -> MethodHeader
//! ```
//!
//! A [`MethodRecord`] never moves once allocated. Everything that refers to
//! it (vtables, call sites, code caches, hook descriptors) stores either a
//! [`MethodRef`] or its [`MethodAddr`](detour_core::MethodAddr), and both
//! stay valid while the owning class loader's arena is alive.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arena;
pub mod class;
pub mod dex;
pub mod flags;
pub mod linker;
pub mod method;
pub mod reflect;

use std::fmt;

pub use arena::LinearArena;
pub use class::ClassRecord;
pub use dex::{CatchHandler, CodeItem, DexFile, DexFileBuilder};
pub use flags::{AccessFlags, MethodKind};
pub use linker::{ClassDef, ClassLinker, MethodDef};
pub use method::{CatchBlock, MethodRecord, MethodRef, NativeSlot};
pub use reflect::{HookDescriptor, ReflectedKind, ReflectedMethod};

// =============================================================================
// Shared Types
// =============================================================================

/// Identity of a class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassLoaderId(pub u32);

impl ClassLoaderId {
    /// The boot class loader.
    pub const BOOT: ClassLoaderId = ClassLoaderId(0);
}

impl fmt::Display for ClassLoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::BOOT {
            f.write_str("boot")
        } else {
            write!(f, "loader#{}", self.0)
        }
    }
}

/// Pointer width of the runtime image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PointerSize {
    /// 4-byte pointers.
    Bits32,
    /// 8-byte pointers.
    #[default]
    Bits64,
}

impl PointerSize {
    /// Pointer width of the host.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "32") {
            PointerSize::Bits32
        } else {
            PointerSize::Bits64
        }
    }

    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }
}

/// How a call site dispatches to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeType {
    /// Static method.
    Static,
    /// Non-virtual instance call (private, constructor, hook backup).
    Direct,
    /// Virtual dispatch through the vtable.
    Virtual,
    /// Dispatch through an interface table.
    Interface,
}
