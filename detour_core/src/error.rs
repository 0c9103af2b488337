//! Error taxonomy.
//!
//! Every non-fatal failure is a [`VmError`]. At the reflective boundary it
//! is converted into a managed [`Throwable`] with [`VmError::to_throwable`].
//! Consistency violations inside a stop-the-world window are not errors:
//! they go through [`fatal!`](crate::fatal).

use crate::value::ObjectRef;
use std::fmt;
use thiserror::Error;

/// Result type used across the runtime.
pub type VmResult<T> = Result<T, VmError>;

// =============================================================================
// Throwable
// =============================================================================

/// A managed exception instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Throwable {
    /// Type descriptor of the exception class (e.g. `Ljava/lang/Error;`).
    pub descriptor: String,
    /// Detail message.
    pub message: String,
    /// Optional managed payload carried along with the exception.
    pub payload: Option<ObjectRef>,
}

impl Throwable {
    /// Create an exception of the given class.
    pub fn new(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a managed payload.
    pub fn with_payload(mut self, payload: ObjectRef) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.descriptor, self.message)
    }
}

// =============================================================================
// VmError
// =============================================================================

/// Errors surfaced by the runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// Caller misuse, e.g. hooking a hook-backup record.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// Operation not valid in the current runtime state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The invoking thread ran out of stack before the call started.
    #[error("stack overflow: depth {depth} reached limit {limit}")]
    StackOverflow {
        /// Frames on the stack when the guard tripped.
        depth: usize,
        /// Permitted frame count.
        limit: usize,
    },

    /// Invocation of an abstract method.
    #[error("abstract method: {0}")]
    AbstractMethod(String),

    /// Invocation of a conflicting default method.
    #[error("incompatible class change: {0}")]
    IncompatibleClassChange(String),

    /// A type could not be resolved.
    #[error("no class def found: {0}")]
    NoClassDefFound(String),

    /// A native method has no registered implementation.
    #[error("unsatisfied link: {0}")]
    UnsatisfiedLink(String),

    /// Exception raised by managed code.
    #[error("{0}")]
    Exception(Throwable),

    /// Internal runtime failure outside a stop-the-world window.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Shorthand for [`VmError::IllegalArgument`].
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        VmError::IllegalArgument(message.into())
    }

    /// Shorthand for [`VmError::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        VmError::IllegalState(message.into())
    }

    /// Managed exception class reported for this error.
    pub fn exception_descriptor(&self) -> &str {
        match self {
            VmError::IllegalArgument(_) => "Ljava/lang/IllegalArgumentException;",
            VmError::IllegalState(_) => "Ljava/lang/IllegalStateException;",
            VmError::StackOverflow { .. } => "Ljava/lang/StackOverflowError;",
            VmError::AbstractMethod(_) => "Ljava/lang/AbstractMethodError;",
            VmError::IncompatibleClassChange(_) => "Ljava/lang/IncompatibleClassChangeError;",
            VmError::NoClassDefFound(_) => "Ljava/lang/NoClassDefFoundError;",
            VmError::UnsatisfiedLink(_) => "Ljava/lang/UnsatisfiedLinkError;",
            VmError::Exception(t) => &t.descriptor,
            VmError::Internal(_) => "Ljava/lang/InternalError;",
        }
    }

    /// Convert into the managed exception raised at the reflective boundary.
    pub fn to_throwable(&self) -> Throwable {
        match self {
            VmError::Exception(t) => t.clone(),
            VmError::IllegalArgument(m)
            | VmError::IllegalState(m)
            | VmError::AbstractMethod(m)
            | VmError::IncompatibleClassChange(m)
            | VmError::NoClassDefFound(m)
            | VmError::UnsatisfiedLink(m)
            | VmError::Internal(m) => Throwable::new(self.exception_descriptor(), m.clone()),
            VmError::StackOverflow { depth, limit } => Throwable::new(
                self.exception_descriptor(),
                format!("stack size {depth}/{limit}"),
            ),
        }
    }
}

impl From<Throwable> for VmError {
    fn from(t: Throwable) -> Self {
        VmError::Exception(t)
    }
}
