//! Transaction coordination
//!
//! The coordinator is a [`Sender`] middleware: it forwards batches to the
//! dispatcher it wraps while maintaining each writing transaction's
//! server-side record. It owns:
//!
//! - the registry of active transactions and their accumulated intent spans
//! - one heartbeat task per tracked transaction
//! - reclassification of server errors into continue/restart/terminate
//! - asynchronous abort of abandoned or cancelled transactions
//! - the transaction metrics surface and the periodic stats log

mod config;
mod coordinator;
mod heartbeat;
mod metadata;
mod metrics;
mod sender;

pub use config::{
    ClusterSettings, CoordinatorConfig, DEFAULT_CLIENT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_INTENTS,
};
pub use coordinator::TxnCoordinator;
pub use metrics::{
    Counter, Histogram, HistogramSnapshot, TxnMetrics, DEFAULT_HISTOGRAM_WINDOW, METRIC_ABANDONS,
    METRIC_ABORTS, METRIC_COMMITS, METRIC_COMMITS_1PC, METRIC_DURATIONS, METRIC_RESTARTS,
    METRIC_RESTARTS_DELETE_RANGE, METRIC_RESTARTS_POSSIBLE_REPLAY, METRIC_RESTARTS_SERIALIZABLE,
    METRIC_RESTARTS_WRITE_TOO_OLD,
};
pub use sender::Sender;
