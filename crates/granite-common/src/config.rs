//! Configuration types for GraniteDB

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Any wait timeout at or above this many seconds means "wait forever".
pub const LOCK_WAIT_TIMEOUT_INFINITE_SECS: u64 = 100_000_000;

/// How much detail a deadlock report carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockReport {
    /// No report is generated.
    Off,
    /// Report the transactions in the cycle and their waiting locks.
    Basic,
    /// Additionally report every lock conflicting with each waiting lock.
    Full,
}

/// Lock subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Number of cells in each lock hash table
    #[serde(default = "default_n_cells")]
    pub n_cells: usize,

    /// How long a transaction waits for a lock before giving up.
    /// Values of 100,000,000 seconds or more mean "wait forever".
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// Whether to run online deadlock detection on every lock wait
    #[serde(default = "default_true")]
    pub deadlock_detect: bool,

    /// Deadlock report verbosity
    #[serde(default = "default_report")]
    pub deadlock_report: DeadlockReport,
}

fn default_n_cells() -> usize {
    2048
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(50)
}

fn default_true() -> bool {
    true
}

fn default_report() -> DeadlockReport {
    DeadlockReport::Full
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            n_cells: default_n_cells(),
            wait_timeout: default_wait_timeout(),
            deadlock_detect: true,
            deadlock_report: DeadlockReport::Full,
        }
    }
}

impl LockConfig {
    /// Validate the configuration. Fatal problems are returned as `Err`.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.n_cells == 0 {
            errors.push("n_cells must be > 0".to_string());
        }

        if self.wait_timeout.is_zero() {
            errors.push("wait_timeout must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether the configured timeout means "wait forever".
    pub fn is_infinite_timeout(&self) -> bool {
        self.wait_timeout.as_secs() >= LOCK_WAIT_TIMEOUT_INFINITE_SECS
    }
}
