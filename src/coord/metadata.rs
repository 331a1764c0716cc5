//! Per-transaction metadata and the active-transaction registry
//!
//! One [`TxnMetadata`] record exists for each transaction that has laid
//! down at least one intent through this coordinator and has not yet been
//! finalized. Records never leave the registry by reference; readers get
//! copies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::protocol::{Span, Transaction, TxnId};

/// Coordinator-local state for one ongoing transaction.
#[derive(Debug)]
pub(crate) struct TxnMetadata {
    /// Last known copy of the transaction record, merged on every request.
    pub txn: Transaction,

    /// Key spans written through this coordinator, accumulated for intent
    /// resolution at commit or abort. May contain duplicates until merged.
    pub keys: Vec<Span>,

    /// Wall nanos at which the record was created (first intent).
    pub first_update_nanos: i64,

    /// Wall nanos of the most recent client request for this transaction.
    /// Atomic so the heartbeat can probe staleness without the registry
    /// lock.
    last_update_nanos: AtomicI64,

    /// Abandonment threshold.
    pub timeout: Duration,

    /// Finalization signal. Closed exactly once by the request path
    /// (`take()` + notify); the heartbeat task exits when it observes the
    /// notification and then removes the record.
    pub txn_end: Option<Arc<Notify>>,
}

impl TxnMetadata {
    pub fn new(
        txn: Transaction,
        keys: Vec<Span>,
        first_update_nanos: i64,
        last_update_nanos: i64,
        timeout: Duration,
    ) -> Self {
        Self {
            txn,
            keys,
            first_update_nanos,
            last_update_nanos: AtomicI64::new(last_update_nanos),
            timeout,
            txn_end: Some(Arc::new(Notify::new())),
        }
    }

    /// Record a client operation at `now_nanos`.
    pub fn set_last_update(&self, now_nanos: i64) {
        self.last_update_nanos.store(now_nanos, Ordering::SeqCst);
    }

    pub fn last_update(&self) -> i64 {
        self.last_update_nanos.load(Ordering::SeqCst)
    }

    /// Whether the client has gone longer than the timeout without driving
    /// this transaction.
    pub fn has_client_abandoned(&self, now_nanos: i64) -> bool {
        let timeout_nanos = self.timeout.as_nanos().min(i64::MAX as u128) as i64;
        self.last_update() < now_nanos.saturating_sub(timeout_nanos)
    }
}

/// Registry of active transactions, keyed by ID.
///
/// One coarse mutex serializes insertion, lookup, removal, and the compound
/// critical sections of the request gate. The lock is never held across a
/// dispatcher call.
#[derive(Debug, Default)]
pub(crate) struct TxnRegistry {
    txns: Mutex<HashMap<TxnId, TxnMetadata>>,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry. Map operations (get, insert-if-absent, remove) go
    /// through the guard.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<TxnId, TxnMetadata>> {
        self.txns.lock()
    }

    pub fn len(&self) -> usize {
        self.txns.lock().len()
    }

    /// Copy of the tracked proto for `id`, if present.
    pub fn get_txn(&self, id: TxnId) -> Option<Transaction> {
        self.txns.lock().get(&id).map(|meta| meta.txn.clone())
    }
}
