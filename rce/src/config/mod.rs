//! Optimizer configuration
//!
//! Loaded from a TOML file (conventionally `rce.toml`); every field has a
//! default so an empty file is a valid configuration.
//!
//! ```toml
//! range_check_elimination = true
//! fold_compares = true
//! loop_predication = true
//! max_classify_depth = 32
//! compile_budget = 10000
//! per_method_trap_limit = 4
//!
//! [stress]
//! reverse_check_order = false
//! rotate_checks = 0
//! reshape_loops = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RceError, Result};
use crate::loops::DEFAULT_CLASSIFY_DEPTH;

/// Optimizer switches and limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RceConfig {
    /// Remove, throw-replace and hoist bounds checks
    #[serde(default = "default_true")]
    pub range_check_elimination: bool,

    /// Fuse two-sided range tests into unsigned compares
    #[serde(default = "default_true")]
    pub fold_compares: bool,

    /// Hoist loop-invariant checks to the loop entry
    #[serde(default = "default_true")]
    pub loop_predication: bool,

    /// Recursion limit when classifying an index expression
    #[serde(default = "default_classify_depth")]
    pub max_classify_depth: usize,

    /// Number of proofs one compilation may attempt
    #[serde(default = "default_compile_budget")]
    pub compile_budget: u64,

    /// Deoptimizations after which a method is compiled without RCE
    #[serde(default = "default_trap_limit")]
    pub per_method_trap_limit: u32,

    #[serde(default)]
    pub stress: StressConfig,
}

/// Visitation-order perturbation, for testing that results do not depend on it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StressConfig {
    #[serde(default)]
    pub reverse_check_order: bool,

    /// Rotate the check visitation order left by this many places
    #[serde(default)]
    pub rotate_checks: usize,

    /// Treat every loop as reshaped before each pass
    #[serde(default)]
    pub reshape_loops: bool,
}

fn default_true() -> bool {
    true
}

fn default_classify_depth() -> usize {
    DEFAULT_CLASSIFY_DEPTH
}

fn default_compile_budget() -> u64 {
    10_000
}

fn default_trap_limit() -> u32 {
    4
}

impl Default for RceConfig {
    fn default() -> Self {
        RceConfig {
            range_check_elimination: true,
            fold_compares: true,
            loop_predication: true,
            max_classify_depth: DEFAULT_CLASSIFY_DEPTH,
            compile_budget: default_compile_budget(),
            per_method_trap_limit: default_trap_limit(),
            stress: StressConfig::default(),
        }
    }
}

impl RceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RceError::config(e.to_string()))
    }

    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RceError::io_error(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RceError::config(e.to_string()))
    }

    /// Configuration with every optimization switched off
    pub fn disabled() -> Self {
        RceConfig {
            range_check_elimination: false,
            fold_compares: false,
            loop_predication: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(RceConfig::from_toml("").unwrap(), RceConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let cfg = RceConfig::from_toml(
            "fold_compares = false\ncompile_budget = 3\n[stress]\nrotate_checks = 2\n",
        )
        .unwrap();
        assert!(!cfg.fold_compares);
        assert!(cfg.range_check_elimination);
        assert_eq!(cfg.compile_budget, 3);
        assert_eq!(cfg.stress.rotate_checks, 2);
        assert!(!cfg.stress.reverse_check_order);
        assert!(!cfg.stress.reshape_loops);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = RceConfig::from_toml("fold_compare = false").unwrap_err();
        assert!(matches!(err, RceError::Config { .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let cfg = RceConfig { per_method_trap_limit: 1, ..RceConfig::default() };
        let text = cfg.to_toml().unwrap();
        assert_eq!(RceConfig::from_toml(&text).unwrap(), cfg);
    }
}
