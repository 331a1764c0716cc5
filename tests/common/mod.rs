//! Shared fixtures for coordinator integration tests
//!
//! Provides a scripted in-process dispatcher (`MockSender`), request
//! builders, and a coordinator environment wired for fast heartbeats.
//!
//! Usage:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use keyline::clock::Clock;
use keyline::coord::{ClusterSettings, CoordinatorConfig, TxnCoordinator, TxnMetrics};
use keyline::protocol::{
    BatchRequest, BatchResponse, EndTxnRequest, Request, Response, Transaction, TxnStatus,
};
use keyline::stopper::Stopper;
use keyline::{RequestContext, Result, Sender};

/// Heartbeat interval used by tests; fast enough that lifecycle tests
/// finish quickly.
pub const TEST_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

type Scripted = Box<dyn FnOnce(&BatchRequest) -> Result<BatchResponse> + Send>;

/// In-process stand-in for the wrapped dispatcher.
///
/// Heartbeat and rollback batches get canned success responses (tunable via
/// the knobs below) so they never consume the script; everything else pops
/// the next scripted response, falling back to [`BatchResponse::ack`].
pub struct MockSender {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<BatchRequest>>,
    fail_heartbeats: AtomicBool,
    heartbeat_status: Mutex<Option<TxnStatus>>,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            fail_heartbeats: AtomicBool::new(false),
            heartbeat_status: Mutex::new(None),
        })
    }

    /// Queue a response for the next non-heartbeat, non-rollback batch.
    pub fn script<F>(&self, f: F)
    where
        F: FnOnce(&BatchRequest) -> Result<BatchResponse> + Send + 'static,
    {
        self.script.lock().push_back(Box::new(f));
    }

    /// Make every subsequent heartbeat dispatch fail.
    pub fn set_fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    /// Override the transaction status reported by heartbeat responses.
    pub fn set_heartbeat_status(&self, status: Option<TxnStatus>) {
        *self.heartbeat_status.lock() = status;
    }

    /// Every batch dispatched so far, in order.
    pub fn sent(&self) -> Vec<BatchRequest> {
        self.sent.lock().clone()
    }

    /// Dispatched batches that were neither heartbeats nor rollbacks.
    pub fn sent_client_batches(&self) -> Vec<BatchRequest> {
        self.sent()
            .into_iter()
            .filter(|ba| !is_heartbeat(ba) && !is_rollback(ba))
            .collect()
    }

    /// Dispatched rollback batches (async aborts).
    pub fn sent_rollbacks(&self) -> Vec<BatchRequest> {
        self.sent().into_iter().filter(is_rollback).collect()
    }
}

fn is_heartbeat(ba: &BatchRequest) -> bool {
    matches!(ba.requests.as_slice(), [Request::HeartbeatTxn { .. }])
}

fn is_rollback(ba: &BatchRequest) -> bool {
    matches!(ba.requests.as_slice(), [Request::EndTxn(et)] if !et.commit)
}

#[async_trait]
impl Sender for MockSender {
    async fn send(&self, _ctx: &RequestContext, ba: BatchRequest) -> Result<BatchResponse> {
        self.sent.lock().push(ba.clone());

        if is_heartbeat(&ba) {
            if self.fail_heartbeats.load(Ordering::SeqCst) {
                return Err(keyline::KeylineError::internal(
                    "injected heartbeat failure",
                ));
            }
            let mut br = BatchResponse::ack(&ba);
            if let Some(status) = *self.heartbeat_status.lock() {
                if let Some(txn) = br.txn.as_mut() {
                    txn.status = status;
                }
                if let Some(Response::HeartbeatTxn { txn }) = br.responses.first_mut() {
                    txn.status = status;
                }
            }
            return Ok(br);
        }

        if is_rollback(&ba) {
            return Ok(BatchResponse::ack(&ba));
        }

        let next = self.script.lock().pop_front();
        match next {
            Some(f) => f(&ba),
            None => Ok(BatchResponse::ack(&ba)),
        }
    }
}

/// A coordinator wired to a [`MockSender`] plus the handles tests poke at.
pub struct TestEnv {
    pub coordinator: Arc<TxnCoordinator>,
    pub mock: Arc<MockSender>,
    pub clock: Arc<Clock>,
    pub settings: Arc<ClusterSettings>,
    pub stopper: Stopper,
}

/// Environment with fast heartbeats and otherwise default configuration.
pub fn setup() -> TestEnv {
    setup_with(
        CoordinatorConfig {
            heartbeat_interval: TEST_HEARTBEAT_INTERVAL,
            ..CoordinatorConfig::default()
        },
        Clock::system(Duration::from_millis(250)),
    )
}

pub fn setup_with(config: CoordinatorConfig, clock: Clock) -> TestEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mock = MockSender::new();
    let clock = Arc::new(clock);
    let settings = Arc::new(ClusterSettings::default());
    let stopper = Stopper::new();
    let coordinator = TxnCoordinator::new(
        Arc::clone(&mock) as Arc<dyn Sender>,
        Arc::clone(&clock),
        config,
        Arc::clone(&settings),
        stopper.clone(),
        TxnMetrics::default(),
    );

    TestEnv {
        coordinator,
        mock,
        clock,
        settings,
        stopper,
    }
}

// ============================================================================
// Request builders
// ============================================================================

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn get(key: &str) -> Request {
    Request::Get { key: b(key) }
}

pub fn put(key: &str) -> Request {
    Request::Put {
        key: b(key),
        value: b("value"),
    }
}

pub fn delete_range(key: &str, end_key: &str) -> Request {
    Request::DeleteRange {
        key: b(key),
        end_key: b(end_key),
    }
}

pub fn begin(key: &str) -> Request {
    Request::BeginTxn { key: b(key) }
}

pub fn end_txn(commit: bool) -> Request {
    Request::EndTxn(EndTxnRequest {
        commit,
        ..Default::default()
    })
}

/// A fresh pending transaction anchored at `key`.
pub fn new_txn(env: &TestEnv, key: &str) -> Transaction {
    Transaction::new("test", b(key), 1.0, env.clock.now())
}

// ============================================================================
// Waiting
// ============================================================================

/// Poll until `condition` holds, panicking after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
