//! Error types for the Keyline transaction coordinator
//!
//! Errors returned through the batch path are structured: they carry a
//! classification (`ErrorDetail`) plus the coordinator's best current view of
//! the transaction, so callers can decide between continuing, restarting,
//! and giving up. Errors that escape to concurrent tasks are never mutated
//! in place; the transaction view is attached to a copy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Transaction, TxnId};

/// Result type alias for Keyline operations.
pub type Result<T> = std::result::Result<T, KeylineError>;

/// Why a retryable error asked for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryReason {
    /// A concurrent writer committed first.
    WriteTooOld,
    /// A forwarded commit timestamp combined with a DeleteRange command.
    DeleteRange,
    /// A forwarded commit timestamp under serializable isolation.
    Serializable,
    /// A possible replay of a command batch at the storage layer.
    PossibleReplay,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::WriteTooOld => write!(f, "write too old"),
            RetryReason::DeleteRange => write!(f, "delete range"),
            RetryReason::Serializable => write!(f, "serializable"),
            RetryReason::PossibleReplay => write!(f, "possible replay"),
        }
    }
}

/// Classification of a batch error.
#[derive(Debug, Clone, Error)]
pub enum ErrorDetail {
    /// The batch was malformed before any dispatch took place.
    #[error("invalid batch: {0}")]
    Validation(String),

    /// The transaction has accumulated more intent spans than the cluster
    /// allows.
    #[error("transaction is too large to commit: {intents} intents")]
    TooLarge { intents: usize },

    /// A writing transaction arrived with no record in the registry.
    #[error("writing transaction timed out or ran on multiple coordinators")]
    NoState,

    /// The local view of the transaction is already finalized.
    #[error("transaction status error: {0}")]
    TransactionStatus(String),

    /// The wrapped dispatcher requires the operation to run inside a
    /// transaction.
    #[error("operation requires transactional context")]
    OpRequiresTxn,

    /// The server asked for a restart of the same transaction.
    #[error("transaction retry required: {reason}")]
    TransactionRetry { reason: RetryReason },

    /// The server-side transaction record was aborted.
    #[error("transaction aborted")]
    TransactionAborted,

    /// A retryable error already reclassified by the coordinator. Carries
    /// the transaction the client should use for its next attempt.
    #[error("retryable transaction error: {msg}")]
    HandledRetryableTxn {
        msg: String,
        /// ID of the attempt that encountered the error.
        txn_id: TxnId,
        /// Prepared transaction for the next attempt. May carry a bumped
        /// epoch or, after an abort, a fresh ID.
        retry_txn: Transaction,
    },

    /// The node is draining and refuses to take on new work.
    #[error("node is draining; cannot start new task")]
    Draining,

    /// Any other dispatch failure.
    #[error("{0}")]
    Internal(String),
}

/// A structured error flowing through the batch path.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct KeylineError {
    detail: ErrorDetail,
    txn: Option<Transaction>,
}

impl KeylineError {
    /// Create an error with no transaction attached.
    pub fn new(detail: ErrorDetail) -> Self {
        Self { detail, txn: None }
    }

    /// Create an error carrying a transaction view.
    pub fn with_txn(detail: ErrorDetail, txn: Transaction) -> Self {
        Self {
            detail,
            txn: Some(txn),
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorDetail::Validation(msg.into()))
    }

    /// Shorthand for a generic dispatch failure.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorDetail::Internal(msg.into()))
    }

    pub fn detail(&self) -> &ErrorDetail {
        &self.detail
    }

    pub fn txn(&self) -> Option<&Transaction> {
        self.txn.as_ref()
    }

    /// Whether this error asks the client to restart the transaction and has
    /// not yet been reclassified by a coordinator.
    pub fn transaction_restart(&self) -> bool {
        matches!(
            self.detail,
            ErrorDetail::TransactionRetry { .. } | ErrorDetail::TransactionAborted
        )
    }

    /// Whether this error was already reclassified into handled-retryable
    /// form.
    pub fn is_handled_retryable(&self) -> bool {
        matches!(self.detail, ErrorDetail::HandledRetryableTxn { .. })
    }

    /// Return a copy of this error with `txn` as the attached transaction
    /// view. The original is left untouched since it may be aliased by
    /// concurrent tasks.
    pub fn with_updated_txn(&self, txn: Transaction) -> Self {
        let mut copy = self.clone();
        copy.txn = Some(txn);
        copy
    }
}

impl From<ErrorDetail> for KeylineError {
    fn from(detail: ErrorDetail) -> Self {
        Self::new(detail)
    }
}
