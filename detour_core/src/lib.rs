//! Core vocabulary shared by every Detour crate.
//!
//! - [`Value`] and [`ObjectRef`]: what flows through invocations
//! - [`CodeAddress`] and [`MethodAddr`]: identities stored in entry-point
//!   slots, code caches and call-site tables
//! - [`VmError`]: the error taxonomy surfaced at the reflective boundary
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod address;
pub mod error;
pub mod value;

pub use address::{CodeAddress, MethodAddr, stubs};
pub use error::{Throwable, VmError, VmResult};
pub use value::{ObjectRef, Value};

/// Terminate on a consistency violation that has no safe recovery.
///
/// The message is logged at `error` level before panicking so that scoped
/// guards (world stop, GC critical sections) are released during unwind.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(%message, "fatal runtime check failed");
        panic!("{}", message)
    }};
}
