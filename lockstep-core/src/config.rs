use lockstep_ast::LockMode;
use serde::Deserialize;

/// Knobs for one run of the lock-discipline pass.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckerConfig {
    /// Lock mode for classes that do not declare one.
    pub default_lock_mode: LockMode,
    /// Stop reporting after this many diagnostics (0 = unlimited).
    pub max_diagnostics: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            default_lock_mode: LockMode::NoLock,
            max_diagnostics: 0,
        }
    }
}
