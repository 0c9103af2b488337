//! Invocation dispatch and live method hooking.
//!
//! # Architecture
//!
//! ```text
//! Runtime
//! ├── ClassLinker          method records, vtables, call sites, AOT code
//! ├── Jit                  code cache + compilation gate
//! ├── Heap                 collection vs. critical sections
//! ├── ThreadList           attached threads, suspend-all
//! ├── StubTable            CodeAddress -> QuickCode
//! │     ├── interpreter bridge ──► Interpreter
//! │     ├── hook trampoline    ──► HookBridge ──► HookCallback
//! │     ├── resolution stub
//! │     └── generic JNI / dlsym lookup
//! ├── Instrumentation      entry/exit shadow records
//! └── DebuggerPolicy       forced interpretation
//! ```
//!
//! [`Runtime::invoke`] is the single way into managed code.
//! [`Runtime::enable_hook`] turns a method into a redirected one inside a
//! [`ScopedWorldStop`]; the original behaviour stays reachable through the
//! backup handed to the callback.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
mod dispatch;
pub mod entrypoints;
pub mod hook;
pub mod instrumentation;
pub mod interpreter;
pub mod rewriter;
pub mod runtime;
pub mod safepoint;
pub mod thread;
pub mod thread_list;

pub use config::RuntimeConfig;
pub use entrypoints::{InvokeContext, QuickCode, QuickOutcome, StubTable, quick_code};
pub use hook::{HookBridge, HookCallback, HookedCall};
pub use instrumentation::{Instrumentation, InstrumentationRecord};
pub use interpreter::{DebuggerPolicy, Interpreter, MethodBody, NoDebugger, TableInterpreter};
pub use runtime::{Runtime, RuntimeBuilder};
pub use safepoint::{SafepointStats, ScopedWorldStop};
pub use thread::{FrameId, ManagedThread, StackFrame, ThreadState, ThreadStats};
pub use thread_list::{SuspendAllGuard, ThreadList};
