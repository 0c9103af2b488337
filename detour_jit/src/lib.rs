//! JIT collaborator surface for the Detour runtime.
//!
//! Code generation is not part of this crate. What the rest of the runtime
//! needs from the JIT is its bookkeeping:
//! - which addresses belong to the compiled-code cache
//! - which method owns a given program counter
//! - migrating or invalidating a method's compiled code
//! - pausing compilation while the world is being rewritten
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod code_cache;
pub mod config;
pub mod gate;
pub mod profiling;

use std::sync::Arc;

use detour_core::{CodeAddress, MethodAddr, VmError};
use thiserror::Error;

pub use code_cache::{CodeCache, CodeCacheStats, CompiledEntry, MethodHeader};
pub use config::JitConfig;
pub use gate::{CompilationGate, CompilationTicket, JitSuspendGuard};
pub use profiling::ProfilingInfo;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the JIT bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JitError {
    /// The code cache cannot hold the requested code.
    #[error("code cache full: requested {requested} bytes, {available} available")]
    CodeCacheFull {
        /// Bytes requested.
        requested: usize,
        /// Bytes left in the cache.
        available: usize,
    },

    /// Zero-sized code cannot be committed.
    #[error("cannot commit empty code for {0}")]
    EmptyCode(MethodAddr),

    /// Compilation is disabled by configuration.
    #[error("JIT compilation is disabled")]
    Disabled,
}

impl From<JitError> for VmError {
    fn from(err: JitError) -> Self {
        VmError::Internal(err.to_string())
    }
}

// =============================================================================
// Jit
// =============================================================================

/// The JIT as seen by the runtime: configuration, code cache and gate.
#[derive(Debug)]
pub struct Jit {
    config: JitConfig,
    code_cache: CodeCache,
    gate: CompilationGate,
}

impl Jit {
    /// Create a JIT with the given configuration.
    pub fn new(config: JitConfig) -> Self {
        let code_cache = CodeCache::new(config.code_cache_base, config.code_cache_capacity);
        Self {
            config,
            code_cache,
            gate: CompilationGate::new(),
        }
    }

    /// Get configuration.
    #[inline]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Get the code cache.
    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// Get the compilation gate.
    #[inline]
    pub fn gate(&self) -> &CompilationGate {
        &self.gate
    }

    /// Suspend compilation until the returned guard is dropped.
    ///
    /// Waits for in-flight compilations to finish.
    pub fn suspend(&self) -> JitSuspendGuard<'_> {
        self.gate.suspend()
    }

    /// Open a commit. Blocks while compilation is suspended.
    ///
    /// The returned [`CodeCommit`] holds a compilation ticket, so checks made
    /// and entry points published before it drops cannot overlap a
    /// suspension window.
    pub fn begin_commit(&self) -> Result<CodeCommit<'_>, JitError> {
        if !self.config.enabled {
            return Err(JitError::Disabled);
        }
        Ok(CodeCommit {
            code_cache: &self.code_cache,
            _ticket: self.gate.begin_compilation(),
        })
    }

    /// Commit freshly generated code for `method`.
    pub fn commit_compiled_code(
        &self,
        method: MethodAddr,
        code_size: usize,
        frame_size: u32,
    ) -> Result<Arc<CompiledEntry>, JitError> {
        self.begin_commit()?.commit(method, code_size, frame_size)
    }

    /// Check if a hotness count warrants profiling data.
    #[inline]
    pub fn is_warm(&self, hotness: u16) -> bool {
        self.config.enabled && hotness >= self.config.warm_threshold
    }

    /// Check if a hotness count warrants compilation.
    #[inline]
    pub fn is_hot(&self, hotness: u16) -> bool {
        self.config.enabled && hotness >= self.config.hot_threshold
    }

    /// Check if `pc` lies inside the code cache.
    #[inline]
    pub fn contains_pc(&self, pc: CodeAddress) -> bool {
        self.code_cache.contains_pc(pc)
    }
}

/// A commit in progress; see [`Jit::begin_commit`].
pub struct CodeCommit<'a> {
    code_cache: &'a CodeCache,
    _ticket: CompilationTicket<'a>,
}

impl CodeCommit<'_> {
    /// Place `code_size` bytes for `method` in the cache.
    pub fn commit(&self, method: MethodAddr, code_size: usize, frame_size: u32) -> Result<Arc<CompiledEntry>, JitError> {
        self.code_cache.commit(method, code_size, frame_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_lands_in_cache() {
        let jit = Jit::new(JitConfig::for_testing());
        let entry = jit.commit_compiled_code(MethodAddr(0x100), 64, 32).unwrap();
        assert!(jit.contains_pc(entry.entry_point()));
        assert!(jit.code_cache().contains_method(MethodAddr(0x100)));
    }

    #[test]
    fn test_open_commit_holds_ticket() {
        let jit = Jit::new(JitConfig::for_testing());
        let commit = jit.begin_commit().unwrap();
        assert_eq!(jit.gate().active_compilations(), 1);
        commit.commit(MethodAddr(0x100), 64, 32).unwrap();
        assert_eq!(jit.gate().active_compilations(), 1);
        drop(commit);
        assert_eq!(jit.gate().active_compilations(), 0);
    }

    #[test]
    fn test_disabled_jit_refuses_commit() {
        let jit = Jit::new(JitConfig::disabled());
        assert_eq!(
            jit.commit_compiled_code(MethodAddr(0x100), 64, 32).unwrap_err(),
            JitError::Disabled
        );
        assert!(!jit.is_warm(u16::MAX));
    }

    #[test]
    fn test_thresholds() {
        let jit = Jit::new(JitConfig::for_testing());
        let warm = jit.config().warm_threshold;
        let hot = jit.config().hot_threshold;
        assert!(!jit.is_warm(warm - 1));
        assert!(jit.is_warm(warm));
        assert!(jit.is_hot(hot));
    }

    #[test]
    fn test_jit_error_converts_to_vm_error() {
        let err: VmError = JitError::CodeCacheFull {
            requested: 10,
            available: 2,
        }
        .into();
        assert!(matches!(err, VmError::Internal(_)));
    }
}
