//! Logging setup and queue status views.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Claimable now.
    pub pending: u64,
    /// Pending but waiting out a backoff.
    pub scheduled: u64,
    pub claimed: u64,
    pub processed: u64,
}

impl QueueCounts {
    pub fn unprocessed(&self) -> u64 {
        self.pending + self.scheduled + self.claimed
    }
}

/// Initialize tracing for the process. `RUST_LOG` wins over the configured
/// level. Safe to call more than once (later calls are no-ops).
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
