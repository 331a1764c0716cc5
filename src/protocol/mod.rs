//! KV protocol types consumed by the coordinator
//!
//! This module defines the data shapes that flow through the transaction
//! coordinator: key spans, the client-visible transaction proto, and batch
//! requests/responses. It deliberately contains no wire codec; routing and
//! encoding belong to the wrapped dispatcher.

mod batch;
mod span;
mod txn;

pub use batch::{BatchHeader, BatchRequest, BatchResponse, EndTxnRequest, Request, Response};
pub use span::{merge_spans, Span};
pub use txn::{
    make_priority, prepare_transaction_for_retry, Transaction, TxnId, TxnStatus,
    NORMAL_USER_PRIORITY,
};
