//! Transaction metrics
//!
//! Counters and histograms here are readable in-process: counters are plain
//! atomics and histograms keep a windowed summary for the periodic stats
//! log. With the `metrics` cargo feature enabled, every update is mirrored
//! to the global `metrics` recorder under the same names, so deployments
//! that run an exporter get these series for free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::RetryReason;

/// Window width for histogram snapshots.
pub const DEFAULT_HISTOGRAM_WINDOW: Duration = Duration::from_secs(60);

pub const METRIC_ABORTS: &str = "txn.aborts";
pub const METRIC_COMMITS: &str = "txn.commits";
pub const METRIC_COMMITS_1PC: &str = "txn.commits1PC";
pub const METRIC_ABANDONS: &str = "txn.abandons";
pub const METRIC_DURATIONS: &str = "txn.durations";
pub const METRIC_RESTARTS: &str = "txn.restarts";
pub const METRIC_RESTARTS_WRITE_TOO_OLD: &str = "txn.restarts.writetooold";
pub const METRIC_RESTARTS_DELETE_RANGE: &str = "txn.restarts.deleterange";
pub const METRIC_RESTARTS_SERIALIZABLE: &str = "txn.restarts.serializable";
pub const METRIC_RESTARTS_POSSIBLE_REPLAY: &str = "txn.restarts.possiblereplay";

/// A named monotonic counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(self.name).increment(1);
    }

    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Summary of one histogram window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub max: i64,
}

#[derive(Debug)]
struct WindowState {
    start: Instant,
    count: u64,
    sum: f64,
    sum_sq: f64,
    max: i64,
}

impl WindowState {
    fn fresh() -> Self {
        Self {
            start: Instant::now(),
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            max: 0,
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        if self.count == 0 {
            return HistogramSnapshot::default();
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        HistogramSnapshot {
            count: self.count,
            mean,
            std_dev: variance.sqrt(),
            max: self.max,
        }
    }
}

/// A named histogram with a rolling summary window.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    window: Duration,
    state: Mutex<WindowState>,
    total_count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, window: Duration) -> Self {
        Self {
            name,
            window,
            state: Mutex::new(WindowState::fresh()),
            total_count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value: i64) {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            self.maybe_rotate(&mut state);
            state.count += 1;
            state.sum += value as f64;
            state.sum_sq += (value as f64) * (value as f64);
            state.max = state.max.max(value);
        }
        #[cfg(feature = "metrics")]
        metrics::histogram!(self.name).record(value as f64);
    }

    /// Summary of the current window, plus the window width for sanity
    /// checks across histograms.
    pub fn windowed(&self) -> (HistogramSnapshot, Duration) {
        let mut state = self.state.lock();
        self.maybe_rotate(&mut state);
        (state.snapshot(), self.window)
    }

    /// Samples recorded over the histogram's lifetime.
    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn maybe_rotate(&self, state: &mut WindowState) {
        if state.start.elapsed() >= self.window {
            *state = WindowState::fresh();
        }
    }
}

/// All metrics relating to KV transactions.
#[derive(Debug)]
pub struct TxnMetrics {
    pub aborts: Counter,
    pub commits: Counter,
    /// Commits that finished in a single phase.
    pub commits_1pc: Counter,
    pub abandons: Counter,

    pub durations: Histogram,
    /// Restart counts per finished transaction.
    pub restarts: Histogram,

    pub restarts_write_too_old: Counter,
    pub restarts_delete_range: Counter,
    pub restarts_serializable: Counter,
    pub restarts_possible_replay: Counter,
}

impl TxnMetrics {
    /// Metrics whose windowed portions retain roughly `histogram_window` of
    /// data.
    pub fn new(histogram_window: Duration) -> Self {
        Self {
            aborts: Counter::new(METRIC_ABORTS),
            commits: Counter::new(METRIC_COMMITS),
            commits_1pc: Counter::new(METRIC_COMMITS_1PC),
            abandons: Counter::new(METRIC_ABANDONS),
            durations: Histogram::new(METRIC_DURATIONS, histogram_window),
            restarts: Histogram::new(METRIC_RESTARTS, histogram_window),
            restarts_write_too_old: Counter::new(METRIC_RESTARTS_WRITE_TOO_OLD),
            restarts_delete_range: Counter::new(METRIC_RESTARTS_DELETE_RANGE),
            restarts_serializable: Counter::new(METRIC_RESTARTS_SERIALIZABLE),
            restarts_possible_replay: Counter::new(METRIC_RESTARTS_POSSIBLE_REPLAY),
        }
    }

    /// The per-reason restart counter.
    pub fn restart_counter(&self, reason: RetryReason) -> &Counter {
        match reason {
            RetryReason::WriteTooOld => &self.restarts_write_too_old,
            RetryReason::DeleteRange => &self.restarts_delete_range,
            RetryReason::Serializable => &self.restarts_serializable,
            RetryReason::PossibleReplay => &self.restarts_possible_replay,
        }
    }
}

impl Default for TxnMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_HISTOGRAM_WINDOW)
    }
}
