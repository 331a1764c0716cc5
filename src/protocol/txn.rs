//! Transaction protos
//!
//! The [`Transaction`] struct mirrors the authoritative server-side
//! transaction record as seen by clients. The coordinator merges server
//! updates into its local copy with [`Transaction::update`]; it never
//! invents fields. Retryable errors are turned into a prepared next attempt
//! by [`prepare_transaction_for_retry`].

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Clock, Timestamp};
use crate::error::{ErrorDetail, KeylineError};

/// The default weight for priority draws.
pub const NORMAL_USER_PRIORITY: f64 = 1.0;

/// Largest assignable transaction priority.
const MAX_TXN_PRIORITY: i32 = i32::MAX - 1;

/// Opaque 128-bit transaction identifier. Equality defines transaction
/// identity across requests.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Mint a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero ID, used as "not yet assigned".
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Abbreviated form for logs; full IDs are noise at this layer.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Authoritative status of a transaction record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum TxnStatus {
    #[default]
    Pending,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Whether the record has reached a terminal state.
    pub fn is_finalized(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

impl std::fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnStatus::Pending => write!(f, "pending"),
            TxnStatus::Committed => write!(f, "committed"),
            TxnStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Client-visible copy of a server-side transaction record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    /// Debug name, carried through restarts.
    pub name: String,
    /// Anchor key; the transaction record lives on this key's range.
    pub key: Bytes,
    /// Restart counter within a single ID.
    pub epoch: u32,
    pub status: TxnStatus,
    /// Provisional commit timestamp.
    pub timestamp: Timestamp,
    pub priority: i32,
    /// Set once the transaction has laid down at least one intent.
    pub writing: bool,
}

impl Transaction {
    pub fn new(name: impl Into<String>, key: Bytes, user_priority: f64, now: Timestamp) -> Self {
        Self {
            id: TxnId::new(),
            name: name.into(),
            key,
            epoch: 0,
            status: TxnStatus::Pending,
            timestamp: now,
            priority: make_priority(user_priority),
            writing: false,
        }
    }

    /// Merge a newer view of the same record into this one. Fields only
    /// ever move forward: the epoch and timestamp ratchet up, a pending
    /// status adopts the other side's, `writing` latches, and the anchor
    /// key is adopted when unset. A nil receiver adopts `other` wholesale.
    pub fn update(&mut self, other: &Transaction) {
        if self.id.is_nil() {
            *self = other.clone();
            return;
        }
        if other.epoch > self.epoch {
            self.epoch = other.epoch;
        }
        if self.status == TxnStatus::Pending {
            self.status = other.status;
        }
        self.timestamp.forward(other.timestamp);
        if other.priority > self.priority {
            self.priority = other.priority;
        }
        self.writing |= other.writing;
        if self.key.is_empty() {
            self.key = other.key.clone();
        }
        if self.name.is_empty() {
            self.name = other.name.clone();
        }
    }

    /// Begin a new epoch of the same transaction after a retryable error.
    pub fn restart(&mut self, user_priority: f64, now: Timestamp) {
        self.epoch += 1;
        self.status = TxnStatus::Pending;
        self.timestamp.forward(now);
        self.priority = self.priority.max(make_priority(user_priority));
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} id={} epoch={} status={}",
            if self.name.is_empty() { "txn" } else { &self.name },
            self.id,
            self.epoch,
            self.status
        )
    }
}

/// Turn a user-level priority weight into a transaction priority.
///
/// Negative weights pin an exact priority. Non-negative weights produce an
/// exponentially distributed draw scaled by the weight, so a transaction
/// with twice the weight wins roughly twice as often.
pub fn make_priority(user_priority: f64) -> i32 {
    if user_priority < 0.0 {
        return (-user_priority).min(MAX_TXN_PRIORITY as f64) as i32;
    }
    let weight = if user_priority == 0.0 {
        NORMAL_USER_PRIORITY
    } else {
        user_priority
    };
    let draw: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    let val = -draw.ln() * weight * f64::from(1u32 << 15);
    val.ceil().clamp(1.0, f64::from(MAX_TXN_PRIORITY)) as i32
}

/// Compute the transaction a client should use for its next attempt after a
/// retryable error.
///
/// An aborted record requires a fresh ID at epoch zero, carrying forward the
/// anchor key, name, priority, and timestamp. Any other retryable error
/// bumps the epoch on the same ID.
pub fn prepare_transaction_for_retry(
    err: &KeylineError,
    user_priority: f64,
    clock: &Clock,
) -> Transaction {
    let mut txn = err.txn().cloned().unwrap_or_default();
    match err.detail() {
        ErrorDetail::TransactionAborted => {
            let mut next =
                Transaction::new(txn.name.clone(), txn.key.clone(), user_priority, clock.now());
            next.priority = next.priority.max(txn.priority);
            next.timestamp.forward(txn.timestamp);
            next
        }
        _ => {
            txn.restart(user_priority, clock.now());
            txn
        }
    }
}
