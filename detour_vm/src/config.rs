//! Runtime configuration.
//!
//! A single struct resolved once at startup. Environment overrides are read
//! by [`RuntimeConfig::from_env`]; nothing consults the environment later.

use detour_gc::GcConfig;
use detour_jit::JitConfig;
use detour_runtime::PointerSize;
use detour_runtime::arena::DEFAULT_ARENA_CAPACITY;

/// Default managed stack depth per thread.
pub const DEFAULT_STACK_FRAME_LIMIT: usize = 1024;

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Managed frames a thread may hold before invocations fail with a stack
    /// overflow.
    ///
    /// Default: 1024
    pub stack_frame_limit: usize,

    /// JIT configuration, `None` to run without a JIT.
    ///
    /// Default: `Some(JitConfig::default())`
    pub jit: Option<JitConfig>,

    /// Collector configuration.
    pub gc: GcConfig,

    /// Pointer width of the runtime image.
    ///
    /// Default: the host's
    pub pointer_size: PointerSize,

    /// Execute everything through the interpreter (`-Xint`).
    ///
    /// Default: false
    pub interpret_only: bool,

    /// Trace every invocation start and return.
    ///
    /// Default: false
    pub log_invocations: bool,

    /// Initial size of each class loader's arena, in bytes.
    ///
    /// Default: 4096
    pub arena_initial_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_frame_limit: DEFAULT_STACK_FRAME_LIMIT,
            jit: Some(JitConfig::default()),
            gc: GcConfig::default(),
            pointer_size: PointerSize::native(),
            interpret_only: false,
            log_invocations: false,
            arena_initial_capacity: DEFAULT_ARENA_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Small limits and a small JIT for tests.
    pub fn for_testing() -> Self {
        Self {
            stack_frame_limit: 64,
            jit: Some(JitConfig::for_testing()),
            gc: GcConfig::for_testing(),
            arena_initial_capacity: 256,
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    ///
    /// - `DETOUR_STACK_LIMIT`: frame limit (ignored unless a positive integer)
    /// - `DETOUR_INTERPRET_ONLY`: run interpreted only
    /// - `DETOUR_NO_JIT`: start without a JIT
    /// - `DETOUR_LOG_INVOCATIONS`: trace invocations
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = lookup("DETOUR_STACK_LIMIT")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            self.stack_frame_limit = limit;
        }
        if Self::truthy(lookup("DETOUR_INTERPRET_ONLY")) {
            self.interpret_only = true;
        }
        if Self::truthy(lookup("DETOUR_NO_JIT")) {
            self.jit = None;
        }
        if Self::truthy(lookup("DETOUR_LOG_INVOCATIONS")) {
            self.log_invocations = true;
        }
        self
    }

    /// Set the stack frame limit.
    pub fn with_stack_frame_limit(mut self, limit: usize) -> Self {
        self.stack_frame_limit = limit;
        self
    }

    /// Set or remove the JIT.
    pub fn with_jit(mut self, jit: Option<JitConfig>) -> Self {
        self.jit = jit;
        self
    }

    /// Non-empty and not `0`.
    #[inline]
    fn truthy(value: Option<String>) -> bool {
        value.is_some_and(|v| !v.is_empty() && v != "0")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_frame_limit, DEFAULT_STACK_FRAME_LIMIT);
        assert!(config.jit.is_some());
        assert!(!config.interpret_only);
        assert!(!config.log_invocations);
    }

    #[test]
    fn test_env_overrides() {
        let config = RuntimeConfig::default().with_env_overrides(env(&[
            ("DETOUR_STACK_LIMIT", "32"),
            ("DETOUR_INTERPRET_ONLY", "1"),
            ("DETOUR_NO_JIT", "yes"),
            ("DETOUR_LOG_INVOCATIONS", "0"),
        ]));
        assert_eq!(config.stack_frame_limit, 32);
        assert!(config.interpret_only);
        assert!(config.jit.is_none());
        assert!(!config.log_invocations);
    }

    #[test]
    fn test_invalid_stack_limit_ignored() {
        for bad in ["", "0", "-4", "lots"] {
            let config = RuntimeConfig::default().with_env_overrides(env(&[("DETOUR_STACK_LIMIT", bad)]));
            assert_eq!(config.stack_frame_limit, DEFAULT_STACK_FRAME_LIMIT);
        }
    }

    #[test]
    fn test_for_testing() {
        let config = RuntimeConfig::for_testing();
        assert_eq!(config.stack_frame_limit, 64);
        assert_eq!(config.jit.unwrap().warm_threshold, 4);
    }
}
