//! Instrumentation configuration resolved from the environment.
//!
//! A single immutable struct read once when the runtime boots; the
//! dispatcher consults plain fields afterwards.

// =============================================================================
// Trace Configuration
// =============================================================================

/// Settings for hook dispatch and code re-instrumentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Request invalidation of compiled machine code when instrumentation
    /// changes (`EMBER_NOJIT`, `EMBER_TRACE_JIT_INVALIDATION`).
    pub jit_invalidation: bool,

    /// Count dispatches, hook calls and cleanups (`EMBER_TRACE_STATS`).
    pub collect_stats: bool,

    /// Ignore `EMBER_*` environment variables (`EMBER_IGNORE_ENVIRONMENT`).
    pub ignore_environment: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            jit_invalidation: true,
            collect_stats: false,
            ignore_environment: false,
        }
    }
}

impl TraceConfig {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let truthy = |var: &str| lookup(var).map(|v| Self::is_truthy(&v));

        if truthy("EMBER_IGNORE_ENVIRONMENT").unwrap_or(false) {
            return Self {
                ignore_environment: true,
                ..Self::default()
            };
        }

        // An explicit invalidation setting wins over the blanket no-JIT switch.
        let jit_invalidation = match truthy("EMBER_TRACE_JIT_INVALIDATION") {
            Some(enabled) => enabled,
            None => !truthy("EMBER_NOJIT").unwrap_or(false),
        };

        Self {
            jit_invalidation,
            collect_stats: truthy("EMBER_TRACE_STATS").unwrap_or(false),
            ignore_environment: false,
        }
    }

    /// Configuration used by tests: statistics on.
    pub fn for_testing() -> Self {
        Self {
            collect_stats: true,
            ..Self::default()
        }
    }

    #[inline]
    fn is_truthy(value: &str) -> bool {
        !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> TraceConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TraceConfig::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve(&[]);
        assert!(config.jit_invalidation);
        assert!(!config.collect_stats);
        assert_eq!(config, TraceConfig::default());
    }

    #[test]
    fn test_nojit_disables_invalidation() {
        assert!(!resolve(&[("EMBER_NOJIT", "1")]).jit_invalidation);
        assert!(resolve(&[("EMBER_NOJIT", "0")]).jit_invalidation);
    }

    #[test]
    fn test_explicit_invalidation_wins() {
        let config = resolve(&[("EMBER_NOJIT", "1"), ("EMBER_TRACE_JIT_INVALIDATION", "1")]);
        assert!(config.jit_invalidation);
    }

    #[test]
    fn test_stats() {
        assert!(resolve(&[("EMBER_TRACE_STATS", "yes")]).collect_stats);
        assert!(!resolve(&[("EMBER_TRACE_STATS", "false")]).collect_stats);
        assert!(!resolve(&[("EMBER_TRACE_STATS", "")]).collect_stats);
    }

    #[test]
    fn test_ignore_environment_blocks_other_vars() {
        let config = resolve(&[("EMBER_IGNORE_ENVIRONMENT", "1"), ("EMBER_TRACE_STATS", "1")]);
        assert!(config.ignore_environment);
        assert!(!config.collect_stats);
    }

    #[test]
    fn test_for_testing() {
        assert!(TraceConfig::for_testing().collect_stats);
    }
}
