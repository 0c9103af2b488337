//! JIT configuration.

use detour_core::CodeAddress;

/// Configuration for the JIT bookkeeping.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Whether compilation is enabled at all.
    ///
    /// Default: true
    pub enabled: bool,

    /// First address of the code cache region.
    ///
    /// Default: 0x7000_0000
    pub code_cache_base: CodeAddress,

    /// Size of the code cache region in bytes.
    ///
    /// Default: 64MB
    pub code_cache_capacity: usize,

    /// Hotness at which a method gets profiling data.
    ///
    /// Default: 1000
    pub warm_threshold: u16,

    /// Hotness at which a method is compiled.
    ///
    /// Default: 10000
    pub hot_threshold: u16,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            code_cache_base: CodeAddress(0x7000_0000),
            code_cache_capacity: 64 * 1024 * 1024,
            warm_threshold: 1000,
            hot_threshold: 10000,
        }
    }
}

impl JitConfig {
    /// Small cache and low thresholds for tests.
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            code_cache_base: CodeAddress(0x7000_0000),
            code_cache_capacity: 64 * 1024,
            warm_threshold: 4,
            hot_threshold: 8,
        }
    }

    /// A configuration that never compiles.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
