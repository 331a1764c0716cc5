//! Coordinator request-gate tests
//!
//! End-to-end coverage of the transaction coordinator's request path
//! against a scripted in-process dispatcher:
//!
//! - batch validation before any dispatch
//! - one-phase commits and the distinct-spans optimization
//! - multi-batch transactions with intent accumulation
//! - retryable-error reclassification
//! - auto-wrapping of non-transactional batches
//! - intent ceilings and read-only commit rejection
//! - the linearizable commit wait

mod common;

use std::time::{Duration, Instant};

use keyline::clock::{Clock, CLOCKLESS_MAX_OFFSET};
use keyline::coord::CoordinatorConfig;
use keyline::protocol::{
    BatchRequest, BatchResponse, EndTxnRequest, Request, Response, Span, TxnStatus,
};
use keyline::{ErrorDetail, KeylineError, RequestContext, RetryReason};

use common::*;

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_empty_transactional_batch_rejected() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let err = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn, vec![]))
        .await
        .expect_err("empty batch must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
    assert!(env.mock.sent().is_empty(), "nothing may be dispatched");
}

#[tokio::test]
async fn test_duplicate_begin_rejected() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a"), begin("a")]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("duplicate begin must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
    assert!(env.mock.sent().is_empty());
}

#[tokio::test]
async fn test_begin_on_writing_txn_rejected() {
    let env = setup();
    let mut txn = new_txn(&env, "a");
    txn.writing = true;
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a")]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("begin on a writing transaction must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
}

#[tokio::test]
async fn test_write_before_begin_rejected() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![put("a")]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("write before begin must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
    assert!(env.mock.sent().is_empty());
}

#[tokio::test]
async fn test_begin_requires_anchor_key() {
    let env = setup();
    let txn = new_txn(&env, "");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a")]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("missing anchor key must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
}

#[tokio::test]
async fn test_end_txn_must_not_carry_key_or_intents() {
    let env = setup();
    let ctx = RequestContext::background();

    let with_key = Request::EndTxn(EndTxnRequest {
        commit: true,
        key: Some(b("x")),
        intent_spans: vec![],
    });
    let err = env
        .coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(new_txn(&env, "a"), vec![begin("a"), put("a"), with_key]),
        )
        .await
        .expect_err("client-set EndTxn key must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));

    let with_intents = Request::EndTxn(EndTxnRequest {
        commit: true,
        key: None,
        intent_spans: vec![Span::point(b("a"))],
    });
    let err = env
        .coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(new_txn(&env, "a"), vec![begin("a"), put("a"), with_intents]),
        )
        .await
        .expect_err("client-supplied intents must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::Validation(_)));
    assert!(env.mock.sent().is_empty());
}

#[tokio::test]
async fn test_read_only_commit_rejected() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![end_txn(true)]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("read-only commit must be rejected");
    match err.detail() {
        ErrorDetail::Validation(msg) => {
            assert!(msg.contains("read-only"), "unexpected message: {msg}")
        }
        other => panic!("unexpected detail: {other:?}"),
    }
    assert!(env.mock.sent().is_empty());
}

#[tokio::test]
async fn test_writing_txn_without_record_rejected() {
    let env = setup();
    let mut txn = new_txn(&env, "a");
    txn.writing = true;
    let ctx = RequestContext::background();

    let err = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn, vec![put("b")]))
        .await
        .expect_err("untracked writing transaction must be rejected");
    assert!(matches!(err.detail(), ErrorDetail::NoState));
    assert_eq!(
        err.to_string(),
        "writing transaction timed out or ran on multiple coordinators"
    );
    assert!(env.mock.sent().is_empty());
}

// ============================================================================
// One-phase commit
// ============================================================================

/// A full begin/write/commit batch completes in one phase: no record is
/// created, no heartbeat runs, and the 1PC counter moves.
#[tokio::test]
async fn test_one_phase_commit() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    env.mock.script(|ba| {
        let mut br = BatchResponse::ack(ba);
        for resp in br.responses.iter_mut() {
            if let Response::EndTxn { one_phase_commit } = resp {
                *one_phase_commit = true;
            }
        }
        Ok(br)
    });

    let ba = BatchRequest::with_txn(txn.clone(), vec![begin("a"), put("a"), end_txn(true)]);
    let br = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect("1PC commit should succeed");

    assert_eq!(br.txn.as_ref().map(|t| t.status), Some(TxnStatus::Committed));
    assert_eq!(env.coordinator.active_txn_count(), 0, "no record expected");
    assert!(env.coordinator.get_txn_state(txn.id).is_none());

    let metrics = env.coordinator.metrics();
    assert_eq!(metrics.commits.count(), 1);
    assert_eq!(metrics.commits_1pc.count(), 1);
    assert_eq!(metrics.aborts.count(), 0);
    assert_eq!(metrics.abandons.count(), 0);

    // The dispatched EndTxn carries the anchor key, exactly the written
    // span, and the distinct-spans marker.
    let sent = env.mock.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].header.distinct_spans);
    let Request::EndTxn(et) = &sent[0].requests[2] else {
        panic!("expected EndTxn");
    };
    assert_eq!(et.key.as_ref(), Some(&b("a")));
    assert_eq!(et.intent_spans, vec![Span::point(b("a"))]);
}

/// Overlapping writes inside a single commit batch clear the
/// distinct-spans marker even with no prior history.
#[tokio::test]
async fn test_overlapping_writes_clear_distinct_spans() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(
        txn,
        vec![begin("a"), put("a"), put("a"), end_txn(true)],
    );
    env.coordinator
        .send_batch(&ctx, ba)
        .await
        .expect("commit should succeed");

    let sent = env.mock.sent();
    assert!(!sent[0].header.distinct_spans);
    let Request::EndTxn(et) = sent[0].requests.last().expect("requests") else {
        panic!("expected EndTxn");
    };
    assert_eq!(et.intent_spans, vec![Span::point(b("a"))]);
}

// ============================================================================
// Multi-batch transactions
// ============================================================================

/// Writes accumulate across batches; the commit carries the union of all
/// spans, sorted and deduplicated, and the record drains after commit.
#[tokio::test]
async fn test_multi_batch_commit() {
    let env = setup();
    let ctx = RequestContext::background();

    // First batch: begin + write. A record appears and heartbeats start.
    let txn = new_txn(&env, "a");
    let br = env
        .coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(txn.clone(), vec![begin("a"), put("a")]),
        )
        .await
        .expect("first batch should succeed");
    let txn = br.txn.expect("updated txn");
    assert!(txn.writing);
    assert_eq!(env.coordinator.active_txn_count(), 1);

    // Second batch: another write on the same transaction.
    let br = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn.clone(), vec![put("b")]))
        .await
        .expect("second batch should succeed");
    let txn = br.txn.expect("updated txn");

    // Third batch: commit. Accumulated spans ride along and the
    // distinct-spans shortcut is off because of the prior history.
    let br = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn.clone(), vec![end_txn(true)]))
        .await
        .expect("commit should succeed");
    assert_eq!(br.txn.as_ref().map(|t| t.status), Some(TxnStatus::Committed));

    let commit = env
        .mock
        .sent_client_batches()
        .pop()
        .expect("commit batch dispatched");
    assert!(!commit.header.distinct_spans);
    let Request::EndTxn(et) = &commit.requests[0] else {
        panic!("expected EndTxn");
    };
    assert_eq!(
        et.intent_spans,
        vec![Span::point(b("a")), Span::point(b("b"))]
    );
    assert_eq!(et.key.as_ref(), Some(&b("a")));

    // The heartbeat task notices the closed record and drains it.
    wait_until("record removal", || env.coordinator.active_txn_count() == 0).await;
    let metrics = env.coordinator.metrics();
    assert_eq!(metrics.commits.count(), 1);
    assert_eq!(metrics.commits_1pc.count(), 0);
    assert_eq!(metrics.durations.total_count(), 1);
}

/// Read-only transactions never touch coordinator state.
#[tokio::test]
async fn test_read_only_txn_leaves_no_state() {
    let env = setup();
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    env.coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn.clone(), vec![get("a")]))
        .await
        .expect("read should succeed");

    assert_eq!(env.coordinator.active_txn_count(), 0);
    let metrics = env.coordinator.metrics();
    assert_eq!(metrics.durations.total_count(), 0);
    assert_eq!(metrics.commits.count(), 0);
}

// ============================================================================
// Retryable errors
// ============================================================================

/// A server retry error is reclassified into handled-retryable form with a
/// same-ID, higher-epoch next attempt, and the record stays tracked.
#[tokio::test]
async fn test_retryable_error_reclassified() {
    let env = setup();
    let ctx = RequestContext::background();

    let txn = new_txn(&env, "a");
    let br = env
        .coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(txn, vec![begin("a"), put("a")]),
        )
        .await
        .expect("first batch should succeed");
    let txn = br.txn.expect("updated txn");

    env.mock.script(|ba| {
        let err_txn = ba.header.txn.clone().expect("transactional batch");
        Err(KeylineError::with_txn(
            ErrorDetail::TransactionRetry {
                reason: RetryReason::WriteTooOld,
            },
            err_txn,
        ))
    });

    let err = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn.clone(), vec![put("b")]))
        .await
        .expect_err("retry error expected");

    match err.detail() {
        ErrorDetail::HandledRetryableTxn {
            txn_id, retry_txn, ..
        } => {
            assert_eq!(*txn_id, txn.id);
            assert_eq!(retry_txn.id, txn.id, "same transaction restarts in place");
            assert_eq!(retry_txn.epoch, txn.epoch + 1);
            assert_eq!(retry_txn.status, TxnStatus::Pending);
        }
        other => panic!("unexpected detail: {other:?}"),
    }

    let metrics = env.coordinator.metrics();
    assert_eq!(metrics.restarts_write_too_old.count(), 1);
    assert_eq!(metrics.restarts_delete_range.count(), 0);

    // The record survives with the bumped proto.
    assert_eq!(env.coordinator.active_txn_count(), 1);
    let tracked = env
        .coordinator
        .get_txn_state(txn.id)
        .expect("record retained");
    assert_eq!(tracked.epoch, txn.epoch + 1);
}

// ============================================================================
// Auto-wrap
// ============================================================================

/// A non-transactional batch refused with OpRequiresTxn is transparently
/// re-executed inside a one-off transaction, and the caller sees neither
/// the transaction nor the synthetic begin/commit.
#[tokio::test]
async fn test_auto_wrap_resend() {
    let env = setup();
    let ctx = RequestContext::background();

    env.mock
        .script(|_ba| Err(KeylineError::new(ErrorDetail::OpRequiresTxn)));

    let br = env
        .coordinator
        .send_batch(&ctx, BatchRequest::new(vec![put("a")]))
        .await
        .expect("auto-wrapped batch should succeed");

    assert!(br.txn.is_none(), "transaction must be stripped");
    assert_eq!(br.responses, vec![Response::Put]);

    // The rewrapped dispatch carries begin + original requests + commit.
    let sent = env.mock.sent_client_batches();
    assert_eq!(sent.len(), 2);
    let wrapped = &sent[1];
    assert!(wrapped.is_transactional());
    assert_eq!(wrapped.requests.len(), 3);
    assert!(matches!(wrapped.requests[0], Request::BeginTxn { .. }));
    assert!(matches!(wrapped.requests[2], Request::EndTxn(_)));

    // The synthetic transaction committed and was accounted for.
    assert_eq!(env.coordinator.metrics().commits.count(), 1);
    assert_eq!(env.coordinator.active_txn_count(), 0);
}

/// The coordinator is itself a `Sender`, so it can be stacked under
/// anything that dispatches batches.
#[tokio::test]
async fn test_coordinator_dispatches_through_sender_trait() {
    let env = setup();
    let sender: &dyn keyline::Sender = &env.coordinator;
    let ctx = RequestContext::background();

    let txn = new_txn(&env, "a");
    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a"), end_txn(true)]);
    let br = sender
        .send(&ctx, ba)
        .await
        .expect("commit through the trait should succeed");
    assert_eq!(br.txn.map(|t| t.status), Some(TxnStatus::Committed));
}

// ============================================================================
// Boundaries
// ============================================================================

/// With a zero intent ceiling, any committing write fails before dispatch.
#[tokio::test]
async fn test_max_intents_zero_rejects_commit() {
    let env = setup();
    env.settings.set_max_intents(0);
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a"), end_txn(true)]);
    let err = env
        .coordinator
        .send_batch(&ctx, ba)
        .await
        .expect_err("commit must exceed the ceiling");
    assert!(matches!(err.detail(), ErrorDetail::TooLarge { intents: 1 }));
    assert!(env.mock.sent().is_empty(), "rejected before dispatch");
}

/// Post-dispatch accumulation is bounded too.
#[tokio::test]
async fn test_max_intents_bounds_accumulation() {
    let env = setup();
    env.settings.set_max_intents(2);
    let ctx = RequestContext::background();

    let txn = new_txn(&env, "a");
    let br = env
        .coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(txn, vec![begin("a"), put("a"), put("b")]),
        )
        .await
        .expect("two intents fit");
    let txn = br.txn.expect("updated txn");

    let err = env
        .coordinator
        .send_batch(&ctx, BatchRequest::with_txn(txn, vec![put("c")]))
        .await
        .expect_err("third intent exceeds the ceiling");
    assert!(matches!(err.detail(), ErrorDetail::TooLarge { intents: 3 }));
}

/// DeleteRange spans are narrowed by the response before accumulation.
#[tokio::test]
async fn test_delete_range_narrowed_by_response() {
    let env = setup();
    let ctx = RequestContext::background();

    env.mock.script(|ba| {
        let mut br = BatchResponse::ack(ba);
        for resp in br.responses.iter_mut() {
            if let Response::DeleteRange { keys } = resp {
                *keys = vec![b("c"), b("d")];
            }
        }
        Ok(br)
    });

    let txn = new_txn(&env, "a");
    env.coordinator
        .send_batch(
            &ctx,
            BatchRequest::with_txn(txn.clone(), vec![begin("a"), delete_range("a", "z")]),
        )
        .await
        .expect("delete range should succeed");

    let tracked = env.coordinator.get_txn_state(txn.id).expect("record");
    assert!(tracked.writing);

    // Committing attaches only the narrowed points, not [a,z).
    let br_txn = tracked;
    env.coordinator
        .send_batch(&ctx, BatchRequest::with_txn(br_txn, vec![end_txn(true)]))
        .await
        .expect("commit should succeed");

    let commit = env
        .mock
        .sent_client_batches()
        .pop()
        .expect("commit dispatched");
    let Request::EndTxn(et) = &commit.requests[0] else {
        panic!("expected EndTxn");
    };
    assert_eq!(
        et.intent_spans,
        vec![Span::point(b("c")), Span::point(b("d"))]
    );
}

// ============================================================================
// Linearizable commits
// ============================================================================

/// With a clockless max offset the linearizable wait is skipped entirely.
#[tokio::test]
async fn test_linearizable_skipped_when_clockless() {
    let env = setup_with(
        CoordinatorConfig {
            heartbeat_interval: TEST_HEARTBEAT_INTERVAL,
            linearizable: true,
            ..CoordinatorConfig::default()
        },
        Clock::system(CLOCKLESS_MAX_OFFSET),
    );
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a"), end_txn(true)]);
    tokio::time::timeout(Duration::from_secs(5), env.coordinator.send_batch(&ctx, ba))
        .await
        .expect("commit must not wait under a clockless max offset")
        .expect("commit should succeed");
}

/// With linearizable mode on, the commit does not return before the max
/// offset has passed the commit timestamp.
#[tokio::test]
async fn test_linearizable_commit_waits() {
    let max_offset = Duration::from_millis(100);
    let env = setup_with(
        CoordinatorConfig {
            heartbeat_interval: TEST_HEARTBEAT_INTERVAL,
            linearizable: true,
            ..CoordinatorConfig::default()
        },
        Clock::system(max_offset),
    );
    let txn = new_txn(&env, "a");
    let ctx = RequestContext::background();

    let started = Instant::now();
    let ba = BatchRequest::with_txn(txn, vec![begin("a"), put("a"), end_txn(true)]);
    env.coordinator
        .send_batch(&ctx, ba)
        .await
        .expect("commit should succeed");

    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "commit returned before the linearizable wait"
    );
}
