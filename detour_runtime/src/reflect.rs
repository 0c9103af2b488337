//! Reflective handles and hook descriptors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use detour_core::ObjectRef;

use crate::method::MethodRef;

/// Whether a reflective handle is a method or a constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectedKind {
    /// `java.lang.reflect.Method`.
    Method,
    /// `java.lang.reflect.Constructor`.
    Constructor,
}

/// Caller-facing reflective handle wrapping a method record.
#[derive(Debug)]
pub struct ReflectedMethod {
    method: MethodRef,
    kind: ReflectedKind,
    accessible: AtomicBool,
}

impl ReflectedMethod {
    /// Wrap `method`, picking the kind from its constructor flag.
    pub fn from_method(method: MethodRef) -> Self {
        let kind = if method.is_constructor() {
            ReflectedKind::Constructor
        } else {
            ReflectedKind::Method
        };
        Self {
            method,
            kind,
            accessible: AtomicBool::new(false),
        }
    }

    /// Mark the handle accessible (or not).
    pub fn with_accessible(self, accessible: bool) -> Self {
        self.accessible.store(accessible, Ordering::Relaxed);
        self
    }

    /// The wrapped record.
    #[inline]
    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// Handle kind.
    #[inline]
    pub fn kind(&self) -> ReflectedKind {
        self.kind
    }

    /// Check if access checks are suppressed.
    #[inline]
    pub fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Relaxed)
    }

    /// Suppress (or restore) access checks.
    #[inline]
    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::Relaxed);
    }
}

/// Hook metadata stored in a redirected method's native-call slot.
///
/// Allocated from the class loader's arena and never freed on its own.
#[derive(Debug)]
pub struct HookDescriptor {
    reflected_method: Arc<ReflectedMethod>,
    additional_info: ObjectRef,
    backup_method: MethodRef,
}

impl HookDescriptor {
    /// Bundle the backup handle, caller data and backup record.
    pub fn new(
        reflected_method: Arc<ReflectedMethod>,
        additional_info: ObjectRef,
        backup_method: MethodRef,
    ) -> Self {
        Self {
            reflected_method,
            additional_info,
            backup_method,
        }
    }

    /// Reflective handle for the backup.
    #[inline]
    pub fn reflected_method(&self) -> &Arc<ReflectedMethod> {
        &self.reflected_method
    }

    /// Caller-supplied auxiliary data.
    #[inline]
    pub fn additional_info(&self) -> &ObjectRef {
        &self.additional_info
    }

    /// The preserved pre-hook record.
    #[inline]
    pub fn backup_method(&self) -> &MethodRef {
        &self.backup_method
    }
}
