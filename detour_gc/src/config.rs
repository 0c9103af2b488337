//! Collector gate configuration.

/// Configuration for the collector gate.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Log every collection and critical section at `debug` level.
    ///
    /// Default: false
    pub trace: bool,

    /// Panic if a critical section is released out of order.
    ///
    /// Cheap bookkeeping; useful while developing new coordination paths.
    ///
    /// Default: true
    pub verify_critical_sections: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            trace: false,
            verify_critical_sections: true,
        }
    }
}

impl GcConfig {
    /// Configuration for tests: tracing on, verification on.
    pub fn for_testing() -> Self {
        Self {
            trace: true,
            verify_critical_sections: true,
        }
    }
}
