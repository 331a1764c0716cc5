//! Coordinator configuration and cluster settings

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default tick period for per-transaction heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default abandonment threshold for non-cancellable request contexts.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling on intent spans per commit.
pub const DEFAULT_MAX_INTENTS: i64 = 100_000;

/// Static configuration for a [`crate::coord::TxnCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Tick period for the per-transaction heartbeat task.
    pub heartbeat_interval: Duration,
    /// How long a transaction may go without a client request before the
    /// coordinator considers it abandoned. Only consulted when the request
    /// context is not cancellable.
    pub client_timeout: Duration,
    /// Delay returning from a commit until `max_offset` past the commit
    /// timestamp, so external observers see a monotone clock.
    pub linearizable: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            linearizable: false,
        }
    }
}

/// Cluster settings the coordinator consults at runtime. Unlike
/// [`CoordinatorConfig`], these may be updated while the node is live.
#[derive(Debug)]
pub struct ClusterSettings {
    max_intents: AtomicI64,
}

impl ClusterSettings {
    pub fn new(max_intents: i64) -> Self {
        Self {
            max_intents: AtomicI64::new(max_intents),
        }
    }

    /// Upper bound on intent spans a single transaction may accumulate.
    pub fn max_intents(&self) -> i64 {
        self.max_intents.load(Ordering::Relaxed)
    }

    pub fn set_max_intents(&self, max_intents: i64) {
        self.max_intents.store(max_intents, Ordering::Relaxed);
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INTENTS)
    }
}
