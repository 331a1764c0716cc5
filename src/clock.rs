//! Hybrid logical clock for the Keyline coordinator
//!
//! Combines wall-clock nanoseconds with a logical counter so timestamps
//! stay ordered within a single node even when several are minted in the
//! same nanosecond. The coordinator consumes three things from the clock:
//! `now()` for heartbeat payloads, `physical_now()` for liveness
//! bookkeeping, and `max_offset()` for the optional linearizable wait.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sentinel max offset reported by deployments that make no bound on clock
/// skew. The linearizable wait is skipped under this value.
pub const CLOCKLESS_MAX_OFFSET: Duration = Duration::MAX;

/// A hybrid logical timestamp: wall nanoseconds plus a logical counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall-clock nanoseconds since the UNIX epoch.
    pub wall_nanos: i64,
    /// Logical counter ordering timestamps within the same nanosecond.
    pub logical: u32,
}

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp {
        wall_nanos: 0,
        logical: 0,
    };

    pub fn new(wall_nanos: i64, logical: u32) -> Self {
        Self { wall_nanos, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// Advance this timestamp to `other` if `other` is larger.
    pub fn forward(&mut self, other: Timestamp) {
        if other > *self {
            *self = other;
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.wall_nanos, self.logical)
    }
}

/// Where the clock reads physical time from.
#[derive(Debug, Clone)]
enum TimeSource {
    /// The system wall clock.
    System,
    /// A shared nanosecond counter, advanced explicitly. Used by tests.
    Manual(Arc<AtomicI64>),
}

/// A hybrid logical clock.
#[derive(Debug)]
pub struct Clock {
    source: TimeSource,
    max_offset: Duration,
    last_wall: AtomicI64,
    logical: AtomicU32,
}

impl Clock {
    /// Create a clock backed by the system wall clock with the given
    /// maximum offset between clocks in the cluster.
    pub fn system(max_offset: Duration) -> Self {
        Self {
            source: TimeSource::System,
            max_offset,
            last_wall: AtomicI64::new(0),
            logical: AtomicU32::new(0),
        }
    }

    /// Create a clock reading physical time from a shared nanosecond
    /// counter. Advancing the counter advances the clock.
    pub fn manual(nanos: Arc<AtomicI64>, max_offset: Duration) -> Self {
        Self {
            source: TimeSource::Manual(nanos),
            max_offset,
            last_wall: AtomicI64::new(0),
            logical: AtomicU32::new(0),
        }
    }

    /// Current physical time in nanoseconds since the UNIX epoch.
    pub fn physical_now(&self) -> i64 {
        match &self.source {
            TimeSource::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .min(i64::MAX as u128) as i64,
            TimeSource::Manual(nanos) => nanos.load(Ordering::SeqCst),
        }
    }

    /// Mint the next hybrid logical timestamp.
    pub fn now(&self) -> Timestamp {
        let wall = self.physical_now();
        let last = self.last_wall.load(Ordering::SeqCst);

        if wall > last {
            // Wall clock advanced: reset the logical counter.
            self.last_wall.store(wall, Ordering::SeqCst);
            self.logical.store(0, Ordering::SeqCst);
            Timestamp::new(wall, 0)
        } else {
            // Same or earlier wall reading: bump the logical counter.
            let prev = self.logical.fetch_add(1, Ordering::SeqCst);
            Timestamp::new(last, prev.saturating_add(1))
        }
    }

    /// The configured bound on clock skew across the cluster, or
    /// [`CLOCKLESS_MAX_OFFSET`] when the deployment makes no such bound.
    pub fn max_offset(&self) -> Duration {
        self.max_offset
    }
}
