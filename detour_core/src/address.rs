//! Code and method addresses.
//!
//! Entry-point slots, code caches and call-site tables never hold Rust
//! references to what they point at. They hold plain addresses, which is
//! what makes the hook installer's in-place mutation visible to every holder.

use std::fmt;

// =============================================================================
// Code Address
// =============================================================================

/// Address of executable code (a stub, JIT output, AOT output or a native function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CodeAddress(pub usize);

impl CodeAddress {
    /// The empty entry point.
    pub const NULL: CodeAddress = CodeAddress(0);

    /// Create from a raw address.
    #[inline]
    pub const fn new(raw: usize) -> Self {
        CodeAddress(raw)
    }

    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Check if this is the empty entry point.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        CodeAddress(self.0 + bytes)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Method Address
// =============================================================================

/// Stable identity of a method record.
///
/// Records are never relocated while their class loader is alive, so the
/// address is usable as a key by the JIT and the class linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodAddr(pub usize);

impl MethodAddr {
    /// Raw address value.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for MethodAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method@{:#x}", self.0)
    }
}

// =============================================================================
// Well-known Stubs
// =============================================================================

/// Fixed addresses of the runtime-provided stubs.
///
/// They live in a reserved low region that neither the JIT code cache nor
/// native registration ever hands out.
pub mod stubs {
    use super::CodeAddress;

    /// Bridge from quick code into the interpreter.
    pub const QUICK_TO_INTERPRETER_BRIDGE: CodeAddress = CodeAddress(0x1000);
    /// Shared interception trampoline for hook-redirected methods.
    pub const QUICK_HOOK_TRAMPOLINE: CodeAddress = CodeAddress(0x1040);
    /// Lazy resolution stub installed before a method is linked.
    pub const QUICK_RESOLUTION_STUB: CodeAddress = CodeAddress(0x1080);
    /// Generic native-call stub used by native methods without compiled glue.
    pub const QUICK_GENERIC_JNI_STUB: CodeAddress = CodeAddress(0x10c0);
    /// Native entry installed before a native method is registered.
    pub const JNI_DLSYM_LOOKUP_STUB: CodeAddress = CodeAddress(0x1100);

    /// End of the reserved stub region.
    pub const STUB_REGION_END: CodeAddress = CodeAddress(0x2000);

    /// Check if an address is one of the runtime stubs.
    #[inline]
    pub fn is_runtime_stub(address: CodeAddress) -> bool {
        address.0 >= QUICK_TO_INTERPRETER_BRIDGE.0 && address.0 < STUB_REGION_END.0
    }
}
