//! Router configuration
//!
//! The router itself is deliberately light on knobs: a gate for the
//! statement-retry paths that are still being rolled out, and the
//! threshold above which a finished transaction is logged as slow.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default slow-transaction threshold (in milliseconds)
pub const DEFAULT_SLOW_TRANSACTION_THRESHOLD_MS: u64 = 100;

/// Configuration for the transaction router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Gate for silently retrying a statement after stale-routing and
    /// snapshot errors. View-resolution retries are always allowed and
    /// do not consult this gate.
    pub enable_stale_version_and_snapshot_retries: bool,

    /// Transactions whose total duration exceeds this threshold are
    /// logged at the end of their lifecycle (in milliseconds)
    pub slow_transaction_threshold_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_stale_version_and_snapshot_retries: false,
            slow_transaction_threshold_ms: DEFAULT_SLOW_TRANSACTION_THRESHOLD_MS,
        }
    }
}

impl RouterConfig {
    pub fn slow_transaction_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_transaction_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RouterConfig::default();
        assert!(!config.enable_stale_version_and_snapshot_retries);
        assert_eq!(
            config.slow_transaction_threshold(),
            Duration::from_millis(100)
        );
    }
}
