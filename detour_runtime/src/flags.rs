//! Access and kind flags for classes and methods.
//!
//! The low bits mirror the dex access flags. Bits from `0x0100_0000` up are
//! runtime-private and never appear in a dex file.

bitflags::bitflags! {
    /// Access flags of a class or method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// `public`.
        const PUBLIC = 0x0001;
        /// `private`.
        const PRIVATE = 0x0002;
        /// `protected`.
        const PROTECTED = 0x0004;
        /// `static`.
        const STATIC = 0x0008;
        /// `final`.
        const FINAL = 0x0010;
        /// `synchronized`.
        const SYNCHRONIZED = 0x0020;
        /// `native`.
        const NATIVE = 0x0100;
        /// Class is an interface.
        const INTERFACE = 0x0200;
        /// `abstract`.
        const ABSTRACT = 0x0400;
        /// Constructor (`<init>` or `<clinit>`).
        const CONSTRUCTOR = 0x0001_0000;
        /// Native method registered for the fast calling convention.
        const FAST_NATIVE = 0x0008_0000;
        /// Default interface method.
        const DEFAULT = 0x0040_0000;
        /// Conflicting default methods were inherited for this slot.
        const DEFAULT_CONFLICT = 0x0080_0000;
        /// Compiled code from the AOT image must be ignored.
        const SKIP_AOT_CODE = 0x0100_0000;
        /// Record created by the runtime rather than loaded from a dex file.
        const RUNTIME_METHOD = 0x0200_0000;
        /// Preserved pre-hook copy of a redirected method.
        const HOOK_BACKUP = 0x1000_0000;
        /// Method whose entry points were redirected to the hook trampoline.
        const HOOK_REDIRECTED = 0x2000_0000;
    }
}

impl AccessFlags {
    /// Flags dropped from a method when it is redirected.
    pub const REDIRECT_CLEARED: AccessFlags = AccessFlags::NATIVE
        .union(AccessFlags::SYNCHRONIZED)
        .union(AccessFlags::ABSTRACT)
        .union(AccessFlags::DEFAULT)
        .union(AccessFlags::DEFAULT_CONFLICT);

    /// Flags selecting a method's hook kind.
    pub const HOOK_KIND: AccessFlags = AccessFlags::HOOK_BACKUP.union(AccessFlags::HOOK_REDIRECTED);
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Hook kind of a method record. Exactly one applies to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// An ordinary loaded method.
    Original,
    /// Preserved copy of a redirected method.
    HookBackup,
    /// Redirected to the hook trampoline.
    HookRedirected,
}

impl MethodKind {
    /// Derive the kind from a flag word.
    ///
    /// A word carrying both hook bits is corrupt and yields `None`.
    pub fn from_flags(flags: AccessFlags) -> Option<Self> {
        match (
            flags.contains(AccessFlags::HOOK_BACKUP),
            flags.contains(AccessFlags::HOOK_REDIRECTED),
        ) {
            (false, false) => Some(MethodKind::Original),
            (true, false) => Some(MethodKind::HookBackup),
            (false, true) => Some(MethodKind::HookRedirected),
            (true, true) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_cleared_flags() {
        let flags = AccessFlags::PUBLIC | AccessFlags::NATIVE | AccessFlags::SYNCHRONIZED;
        let redirected = (flags - AccessFlags::REDIRECT_CLEARED) | AccessFlags::HOOK_REDIRECTED;
        assert_eq!(redirected, AccessFlags::PUBLIC | AccessFlags::HOOK_REDIRECTED);
    }

    #[test]
    fn test_method_kind_from_flags() {
        assert_eq!(
            MethodKind::from_flags(AccessFlags::PUBLIC),
            Some(MethodKind::Original)
        );
        assert_eq!(
            MethodKind::from_flags(AccessFlags::HOOK_BACKUP),
            Some(MethodKind::HookBackup)
        );
        assert_eq!(
            MethodKind::from_flags(AccessFlags::HOOK_REDIRECTED | AccessFlags::STATIC),
            Some(MethodKind::HookRedirected)
        );
        assert_eq!(MethodKind::from_flags(AccessFlags::HOOK_KIND), None);
    }

    #[test]
    fn test_runtime_bits_do_not_overlap_dex_bits() {
        let runtime = AccessFlags::SKIP_AOT_CODE
            | AccessFlags::RUNTIME_METHOD
            | AccessFlags::HOOK_BACKUP
            | AccessFlags::HOOK_REDIRECTED;
        assert!(runtime.bits() >= 0x0100_0000);
        assert!((runtime & AccessFlags::DEFAULT_CONFLICT).is_empty());
    }
}
