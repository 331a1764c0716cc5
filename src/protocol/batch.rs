//! Batch requests and responses
//!
//! A batch is an ordered collection of KV requests plus a header that
//! optionally ties the batch to a transaction. Responses mirror requests
//! positionally. These are the inputs the coordinator gates and enriches;
//! no wire encoding lives here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::protocol::span::Span;
use crate::protocol::txn::{Transaction, TxnStatus, NORMAL_USER_PRIORITY};

/// A single KV request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Get { key: Bytes },
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    DeleteRange { key: Bytes, end_key: Bytes },
    Scan { key: Bytes, end_key: Bytes },
    /// Create the transaction record, anchored at `key`.
    BeginTxn { key: Bytes },
    EndTxn(EndTxnRequest),
    /// Liveness ping for the transaction record.
    HeartbeatTxn { key: Bytes, now: Timestamp },
}

/// Finalize a transaction, committing or rolling back its intents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndTxnRequest {
    pub commit: bool,
    /// Anchor key of the transaction record. Populated by the coordinator;
    /// clients must leave it unset.
    pub key: Option<Bytes>,
    /// Spans whose intents the receiving replica resolves. Populated by the
    /// coordinator; clients must leave it empty.
    pub intent_spans: Vec<Span>,
}

impl Request {
    /// True for requests that lay down intents.
    pub fn is_intent_write(&self) -> bool {
        matches!(
            self,
            Request::Put { .. } | Request::Delete { .. } | Request::DeleteRange { .. }
        )
    }
}

/// Response payload for a single request, positionally matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Get { value: Option<Bytes> },
    Put,
    Delete,
    /// Keys actually deleted, used to narrow the intent span.
    DeleteRange { keys: Vec<Bytes> },
    Scan { rows: Vec<(Bytes, Bytes)> },
    BeginTxn,
    EndTxn { one_phase_commit: bool },
    HeartbeatTxn { txn: Transaction },
}

/// Header shared by all requests in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    /// The transaction this batch runs in, if any.
    pub txn: Option<Transaction>,
    /// Weight for priority draws on transactions created for this batch.
    pub user_priority: f64,
    /// Set by the coordinator when the attached intent spans are known to be
    /// pairwise disjoint without merging.
    pub distinct_spans: bool,
}

impl Default for BatchHeader {
    fn default() -> Self {
        Self {
            txn: None,
            user_priority: NORMAL_USER_PRIORITY,
            distinct_spans: false,
        }
    }
}

/// An ordered collection of requests under one header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub header: BatchHeader,
    pub requests: Vec<Request>,
}

impl BatchRequest {
    /// A non-transactional batch.
    pub fn new(requests: Vec<Request>) -> Self {
        Self {
            header: BatchHeader::default(),
            requests,
        }
    }

    /// A batch running in `txn`.
    pub fn with_txn(txn: Transaction, requests: Vec<Request>) -> Self {
        Self {
            header: BatchHeader {
                txn: Some(txn),
                ..BatchHeader::default()
            },
            requests,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.header.txn.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn has_begin_txn(&self) -> bool {
        self.requests
            .iter()
            .any(|r| matches!(r, Request::BeginTxn { .. }))
    }

    /// Position of the `EndTxn` request, if the batch carries one.
    pub fn end_txn_index(&self) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| matches!(r, Request::EndTxn(_)))
    }

    pub fn has_end_txn(&self) -> bool {
        self.end_txn_index().is_some()
    }

    /// Visit the intent span of every write in the batch.
    ///
    /// When a response is supplied, DeleteRange spans are narrowed to the
    /// keys the server reports as actually deleted. Reads and transaction
    /// bookkeeping requests contribute no spans.
    pub fn intent_span_iterate<F: FnMut(Span)>(&self, br: Option<&BatchResponse>, mut f: F) {
        for (idx, req) in self.requests.iter().enumerate() {
            match req {
                Request::Put { key, .. } | Request::Delete { key } => f(Span::point(key.clone())),
                Request::DeleteRange { key, end_key } => {
                    if let Some(Response::DeleteRange { keys }) =
                        br.and_then(|br| br.responses.get(idx))
                    {
                        for deleted in keys {
                            f(Span::point(deleted.clone()));
                        }
                    } else {
                        f(Span::range(key.clone(), end_key.clone()));
                    }
                }
                _ => {}
            }
        }
    }
}

/// Responses for a batch, positionally matched to its requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Updated transaction record, when the batch was transactional.
    pub txn: Option<Transaction>,
    pub responses: Vec<Response>,
}

impl BatchResponse {
    /// Whether the batch committed in a single phase.
    pub fn one_phase_commit(&self) -> bool {
        self.responses.iter().any(
            |r| matches!(r, Response::EndTxn { one_phase_commit } if *one_phase_commit),
        )
    }

    /// Synthesize a plain success response for `ba`: every request
    /// acknowledged, the transaction echoed back with `writing` latched on
    /// any intent write and the status finalized by an `EndTxn`. In-process
    /// stubs and tests stand in for a real dispatcher with this.
    pub fn ack(ba: &BatchRequest) -> Self {
        let mut txn = ba.header.txn.clone();
        if let Some(txn) = txn.as_mut() {
            if ba.has_begin_txn() || ba.requests.iter().any(Request::is_intent_write) {
                txn.writing = true;
            }
            for req in &ba.requests {
                if let Request::EndTxn(et) = req {
                    txn.status = if et.commit {
                        TxnStatus::Committed
                    } else {
                        TxnStatus::Aborted
                    };
                }
            }
        }

        let responses = ba
            .requests
            .iter()
            .map(|req| match req {
                Request::Get { .. } => Response::Get { value: None },
                Request::Put { .. } => Response::Put,
                Request::Delete { .. } => Response::Delete,
                Request::DeleteRange { .. } => Response::DeleteRange { keys: Vec::new() },
                Request::Scan { .. } => Response::Scan { rows: Vec::new() },
                Request::BeginTxn { .. } => Response::BeginTxn,
                Request::EndTxn(_) => Response::EndTxn {
                    one_phase_commit: false,
                },
                Request::HeartbeatTxn { .. } => Response::HeartbeatTxn {
                    txn: txn.clone().unwrap_or_default(),
                },
            })
            .collect();

        Self { txn, responses }
    }
}
