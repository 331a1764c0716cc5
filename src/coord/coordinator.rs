//! Client-side transaction coordination
//!
//! [`TxnCoordinator`] implements [`Sender`] by wrapping a lower-level
//! dispatcher. It acts as a man-in-the-middle for transactional batches:
//! once a transaction starts writing, the coordinator heartbeats its record
//! to keep it live, tracks every key span the transaction writes, and
//! attaches the accumulated spans to the eventual `EndTxn` so the receiving
//! replica can resolve the intents. Server responses flow back through the
//! state-update engine, which reclassifies retryable errors into prepared
//! next attempts.
//!
//! # Concurrency
//!
//! A single mutex guards the registry of active transactions. It is held
//! for lookups, record mutation, and commit enrichment, and never across a
//! call to the wrapped dispatcher. Each tracked transaction owns one
//! heartbeat task; the stats logger and async-abort tasks run independently
//! under the node's [`Stopper`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, CLOCKLESS_MAX_OFFSET};
use crate::context::RequestContext;
use crate::coord::config::{ClusterSettings, CoordinatorConfig};
use crate::coord::metadata::{TxnMetadata, TxnRegistry};
use crate::coord::metrics::TxnMetrics;
use crate::coord::sender::Sender;
use crate::error::{ErrorDetail, KeylineError, Result};
use crate::protocol::{
    merge_spans, prepare_transaction_for_retry, BatchHeader, BatchRequest, BatchResponse,
    EndTxnRequest, Request, Span, Transaction, TxnId, TxnStatus, NORMAL_USER_PRIORITY,
};
use crate::stopper::Stopper;

/// How often the stats logger reports.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Client-side transaction coordinator.
///
/// Wraps a lower-level [`Sender`] and coordinates transaction state for
/// clients: liveness heartbeats, intent-span accumulation, retry
/// classification, and cleanup of stranded transactions.
pub struct TxnCoordinator {
    pub(crate) wrapped: Arc<dyn Sender>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) config: CoordinatorConfig,
    settings: Arc<ClusterSettings>,
    pub(crate) stopper: Stopper,
    pub(crate) metrics: TxnMetrics,
    pub(crate) txns: TxnRegistry,
}

impl TxnCoordinator {
    /// Create a coordinator wrapping `wrapped` and start its stats logger.
    pub fn new(
        wrapped: Arc<dyn Sender>,
        clock: Arc<Clock>,
        config: CoordinatorConfig,
        settings: Arc<ClusterSettings>,
        stopper: Stopper,
        metrics: TxnMetrics,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            wrapped,
            clock,
            config,
            settings,
            stopper,
            metrics,
            txns: TxnRegistry::new(),
        });

        let worker = Arc::clone(&coordinator);
        if coordinator
            .stopper
            .spawn("txn coordinator stats", async move {
                worker.stats_loop().await;
            })
            .is_err()
        {
            debug!("stats logger not started; node is draining");
        }

        coordinator
    }

    /// The coordinator's metrics registry.
    pub fn metrics(&self) -> &TxnMetrics {
        &self.metrics
    }

    /// Number of transactions currently tracked.
    pub fn active_txn_count(&self) -> usize {
        self.txns.len()
    }

    /// Copy of the locally tracked proto for `id`, if any.
    pub fn get_txn_state(&self, id: TxnId) -> Option<Transaction> {
        self.txns.get_txn(id)
    }

    /// Execute a batch. See the module docs for the full gate behavior.
    pub async fn send_batch(
        self: &Arc<Self>,
        ctx: &RequestContext,
        mut ba: BatchRequest,
    ) -> Result<BatchResponse> {
        let start_ns = self.clock.physical_now();

        if let Some(txn) = ba.header.txn.clone() {
            self.validate_txn_for_batch(&ba)?;

            if let Some(et_idx) = ba.end_txn_index() {
                if let Request::EndTxn(et) = &ba.requests[et_idx] {
                    if et.key.is_some() {
                        return Err(KeylineError::validation(
                            "EndTxn must not have a key set",
                        ));
                    }
                    if !et.intent_spans.is_empty() {
                        return Err(KeylineError::validation(
                            "client must not pass intents to EndTxn",
                        ));
                    }
                }
                if let Request::EndTxn(et) = &mut ba.requests[et_idx] {
                    et.key = Some(txn.key.clone());
                }
            }

            {
                let mut txns = self.txns.lock();
                self.maybe_reject_client_locked(&mut txns, &txn)?;

                // Everything below only applies when trying to commit.
                if let Some(et_idx) = ba.end_txn_index() {
                    // Seed from previously accumulated writes, then fold in
                    // the current batch. No response yet, so spans cannot be
                    // narrowed here.
                    let mut spans: Vec<Span> = txns
                        .get(&txn.id)
                        .map(|meta| meta.keys.clone())
                        .unwrap_or_default();
                    let prior_empty = spans.is_empty();
                    ba.intent_span_iterate(None, |span| spans.push(span));

                    let (merged, distinct) = merge_spans(&spans);
                    // Prior requests in the transaction rule out the
                    // distinct-spans shortcut; it is a 1PC optimization.
                    ba.header.distinct_spans = distinct && prior_empty;

                    if merged.is_empty() {
                        // Read-only transactions keep all state client-side;
                        // there is factually nothing to end.
                        return Err(KeylineError::validation(
                            "cannot commit a read-only transaction",
                        ));
                    }
                    if merged.len() as i64 > self.settings.max_intents() {
                        return Err(KeylineError::new(ErrorDetail::TooLarge {
                            intents: merged.len(),
                        }));
                    }

                    for span in &merged {
                        debug!(txn = %txn.id, intent = %span, "commit intent");
                    }

                    if let Some(meta) = txns.get_mut(&txn.id) {
                        meta.keys = merged.clone();
                    }
                    if let Request::EndTxn(et) = &mut ba.requests[et_idx] {
                        et.intent_spans = merged;
                    }
                }
            }
        }

        let mut result = self.wrapped.send(ctx, ba.clone()).await;
        if matches!(&result, Err(err) if matches!(err.detail(), ErrorDetail::OpRequiresTxn)) {
            result = self.resend_with_txn(ctx, &ba).await;
        }

        let (br, err) = match result {
            Ok(br) => (Some(br), None),
            Err(err) => (None, Some(err)),
        };
        if let Some(err) = self.update_state(ctx, start_ns, &ba, br.as_ref(), err) {
            debug!(error = %err, "batch failed");
            return Err(err);
        }
        let Some(br) = br else {
            return Err(KeylineError::internal(
                "dispatcher returned neither a response nor an error",
            ));
        };

        let Some(resp_txn) = br.txn.clone() else {
            return Ok(br);
        };
        if !ba.has_end_txn() {
            return Ok(br);
        }

        if resp_txn.status != TxnStatus::Pending {
            let mut txns = self.txns.lock();
            self.cleanup_txn_locked(&mut txns, &resp_txn);
        }

        // All clocks in the system must be past the commit timestamp before
        // control returns to the client. Skipped for clockless deployments,
        // where there is no bound to wait out.
        let max_offset = self.clock.max_offset();
        if self.config.linearizable && max_offset != CLOCKLESS_MAX_OFFSET {
            let commit_ns = start_ns.min(resp_txn.timestamp.wall_nanos);
            let elapsed = self.clock.physical_now().saturating_sub(commit_ns);
            let max_offset_ns = max_offset.as_nanos().min(i64::MAX as u128) as i64;
            let sleep_ns = max_offset_ns.saturating_sub(elapsed);
            if sleep_ns > 0 {
                debug!(
                    txn = %resp_txn,
                    wait_ms = sleep_ns / 1_000_000,
                    "waiting on commit for linearizability"
                );
                tokio::time::sleep(Duration::from_nanos(sleep_ns as u64)).await;
            }
        }

        Ok(br)
    }

    /// Validate properties of the transaction specified on a batch. No
    /// transactional write may run before a begin unless the transaction is
    /// already writing.
    fn validate_txn_for_batch(&self, ba: &BatchRequest) -> Result<()> {
        let Some(txn) = &ba.header.txn else {
            return Ok(());
        };
        if ba.is_empty() {
            return Err(KeylineError::validation("empty batch with transaction"));
        }

        let mut have_begin = false;
        for req in &ba.requests {
            if matches!(req, Request::BeginTxn { .. }) {
                if have_begin || txn.writing {
                    return Err(KeylineError::validation(format!(
                        "begin transaction requested twice in the same transaction: {txn}"
                    )));
                }
                if txn.key.is_empty() {
                    return Err(KeylineError::validation(
                        "transaction with begin request missing anchor key",
                    ));
                }
                have_begin = true;
            }
        }

        if !txn.writing && !have_begin && ba.requests.iter().any(Request::is_intent_write) {
            return Err(KeylineError::validation(
                "transactional write before begin transaction",
            ));
        }
        Ok(())
    }

    /// Check whether the transactional request is in a state that prevents
    /// it from continuing: the coordinator may have considered the client
    /// abandoned, or a heartbeat may have reported the record finalized.
    fn maybe_reject_client_locked(
        &self,
        txns: &mut HashMap<TxnId, TxnMetadata>,
        txn: &Transaction,
    ) -> Result<()> {
        if !txn.writing {
            return Ok(());
        }
        let Some(meta) = txns.get(&txn.id) else {
            debug!(txn = %txn.id, "rejecting unknown transaction");
            return Err(KeylineError::new(ErrorDetail::NoState));
        };
        match meta.txn.status {
            TxnStatus::Pending => Ok(()),
            TxnStatus::Aborted => {
                let local = meta.txn.clone();
                self.cleanup_txn_locked(txns, &local);
                let aborted = KeylineError::with_txn(ErrorDetail::TransactionAborted, local);
                let retry_txn =
                    prepare_transaction_for_retry(&aborted, NORMAL_USER_PRIORITY, &self.clock);
                Err(KeylineError::new(ErrorDetail::HandledRetryableTxn {
                    msg: aborted.to_string(),
                    txn_id: txn.id,
                    retry_txn,
                }))
            }
            TxnStatus::Committed => {
                let local = meta.txn.clone();
                self.cleanup_txn_locked(txns, &local);
                Err(KeylineError::with_txn(
                    ErrorDetail::TransactionStatus("transaction is already committed".to_string()),
                    local,
                ))
            }
        }
    }

    /// Close the record's finalization signal and store the final proto.
    /// The heartbeat task removes the record once it observes the signal.
    pub(crate) fn cleanup_txn_locked(
        &self,
        txns: &mut HashMap<TxnId, TxnMetadata>,
        txn: &Transaction,
    ) {
        let Some(meta) = txns.get_mut(&txn.id) else {
            return;
        };
        // The signal may already be closed if we are racing with heartbeat
        // teardown.
        if meta.txn_end.is_none() {
            return;
        }
        debug!(txn = %txn.id, "coordinator stops");
        meta.txn = txn.clone();
        if let Some(signal) = meta.txn_end.take() {
            signal.notify_one();
        }
    }

    /// Merge the outcome of a dispatch into local state, in both the
    /// success and error cases. Retryable errors are reclassified into
    /// handled-retryable form carrying a prepared next attempt. Returns the
    /// error to surface to the caller, if any.
    fn update_state(
        self: &Arc<Self>,
        ctx: &RequestContext,
        start_ns: i64,
        ba: &BatchRequest,
        br: Option<&BatchResponse>,
        err: Option<KeylineError>,
    ) -> Option<KeylineError> {
        let mut txns = self.txns.lock();

        let Some(ba_txn) = &ba.header.txn else {
            // Not a transactional request.
            return err;
        };
        let txn_id = ba_txn.id;

        let mut cleanup_old_txn = false;
        let mut new_txn = Transaction::default();
        let err = match err {
            None => {
                new_txn.update(ba_txn);
                if let Some(br_txn) = br.and_then(|br| br.txn.as_ref()) {
                    new_txn.update(br_txn);
                }
                None
            }
            Some(err) if err.transaction_restart() => {
                let err_txn_id = err.txn().map(|t| t.id).unwrap_or_default();
                if err_txn_id != txn_id {
                    // The dispatcher must not return retry errors for
                    // transactions other than the one in the batch.
                    panic!(
                        "retryable error for the wrong transaction; batch txn: {ba_txn}, error: {err}"
                    );
                }
                if let ErrorDetail::TransactionRetry { reason } = err.detail() {
                    self.metrics.restart_counter(*reason).inc();
                }
                new_txn = prepare_transaction_for_retry(&err, ba.header.user_priority, &self.clock);
                if err_txn_id != new_txn.id {
                    // The ID changed: a new transaction had to be started
                    // and the old one is toast. Cleaned up below, after the
                    // record merge, to avoid racing with it.
                    cleanup_old_txn = true;
                }
                Some(KeylineError::new(ErrorDetail::HandledRetryableTxn {
                    msg: err.to_string(),
                    txn_id: err_txn_id,
                    retry_txn: new_txn.clone(),
                }))
            }
            Some(err) => {
                new_txn.update(ba_txn);
                if let Some(err_txn) = err.txn() {
                    new_txn.update(err_txn);
                }
                // Attach the merged view on a copy; the original error may
                // have escaped to other tasks.
                Some(err.with_updated_txn(new_txn.clone()))
            }
        };

        let has_meta = txns.contains_key(&txn_id);
        let surfaced = 'update: {
            // The record is created by the first writing operation. A batch
            // that fails but still manages to lay down intents (for
            // example, a multi-range write) is marked writing and must be
            // tracked too: only the coordinator can feed those intents to
            // an eventual EndTxn.
            if has_meta || err.is_none() || new_txn.writing {
                let mut keys: Vec<Span> = txns
                    .get(&txn_id)
                    .map(|meta| meta.keys.clone())
                    .unwrap_or_default();
                // Collecting intents even on error reduces how long a
                // dangling intent can block concurrent writers.
                ba.intent_span_iterate(br, |span| keys.push(span));

                if keys.len() as i64 > self.settings.max_intents() {
                    // The new intents are already written, but bailing here
                    // stops transactions that can never commit anyway.
                    break 'update Some(KeylineError::new(ErrorDetail::TooLarge {
                        intents: keys.len(),
                    }));
                }

                if has_meta {
                    if let Some(meta) = txns.get_mut(&txn_id) {
                        meta.keys = keys;
                    }
                } else if !keys.is_empty() {
                    if err.is_some() || !ba.has_end_txn() {
                        debug!(txn = %txn_id, "coordinator spawns");
                        let meta = TxnMetadata::new(
                            new_txn.clone(),
                            keys,
                            start_ns,
                            self.clock.physical_now(),
                            self.config.client_timeout,
                        );
                        txns.insert(txn_id, meta);

                        let worker = Arc::clone(self);
                        let hb_ctx = ctx.clone();
                        if let Err(spawn_err) = self.stopper.spawn("txn heartbeat loop", async move {
                            worker.heartbeat_loop(hb_ctx, txn_id).await;
                        }) {
                            // Draining. Refuse the transaction rather than
                            // track one nobody will clean up.
                            self.unregister_txn_locked(&mut txns, txn_id);
                            break 'update Some(spawn_err);
                        }
                    } else {
                        // Successful one-phase commit: no heartbeat ever
                        // runs, so account for the transaction here.
                        let one_pc = br.map(BatchResponse::one_phase_commit).unwrap_or(false);
                        let duration = self.clock.physical_now() - start_ns;
                        self.update_stats(duration, 0, new_txn.status, one_pc);
                    }
                }
            }

            // Update the tracked record, even on error.
            if let Some(meta) = txns.get_mut(&txn_id) {
                meta.txn.update(&new_txn);
                meta.set_last_update(self.clock.physical_now());
            }

            err
        };

        if cleanup_old_txn {
            self.cleanup_txn_locked(&mut txns, ba_txn);
        }

        surfaced
    }

    /// Re-execute a non-transactional batch inside a one-off transaction.
    /// Invoked when the wrapped dispatcher reports that an operation
    /// requires a transactional context. The caller never asked for a
    /// transaction, so the synthetic begin/commit responses are stripped
    /// and the transaction field is cleared.
    async fn resend_with_txn(
        self: &Arc<Self>,
        ctx: &RequestContext,
        ba: &BatchRequest,
    ) -> Result<BatchResponse> {
        debug!(requests = ba.requests.len(), "auto-wrapping in transaction and re-executing");

        let anchor = ba
            .requests
            .iter()
            .find_map(|req| match req {
                Request::Get { key }
                | Request::Put { key, .. }
                | Request::Delete { key }
                | Request::DeleteRange { key, .. }
                | Request::Scan { key, .. } => Some(key.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let mut retry_txn: Option<Transaction> = None;
        loop {
            let txn = match retry_txn.take() {
                Some(txn) => txn,
                None => Transaction::new(
                    "auto-wrap",
                    anchor.clone(),
                    ba.header.user_priority,
                    self.clock.now(),
                ),
            };

            let mut requests = Vec::with_capacity(ba.requests.len() + 2);
            let has_begin = !txn.writing;
            if has_begin {
                requests.push(Request::BeginTxn {
                    key: txn.key.clone(),
                });
            }
            requests.extend(ba.requests.iter().cloned());
            requests.push(Request::EndTxn(EndTxnRequest {
                commit: true,
                ..Default::default()
            }));

            let inner = BatchRequest {
                header: BatchHeader {
                    txn: Some(txn),
                    user_priority: ba.header.user_priority,
                    distinct_spans: false,
                },
                requests,
            };

            match self.send_boxed(ctx, inner).await {
                Ok(mut br) => {
                    // Hide the evidence.
                    br.txn = None;
                    if br.responses.len() == ba.requests.len() + 1 + usize::from(has_begin) {
                        br.responses.pop();
                        if has_begin {
                            br.responses.remove(0);
                        }
                    }
                    return Ok(br);
                }
                Err(err) => {
                    if let ErrorDetail::HandledRetryableTxn { retry_txn: next, .. } = err.detail()
                    {
                        retry_txn = Some(next.clone());
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Boxed recursion point for [`Self::send_batch`].
    fn send_boxed<'a>(
        self: &'a Arc<Self>,
        ctx: &'a RequestContext,
        ba: BatchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BatchResponse>> + Send + 'a>> {
        Box::pin(self.send_batch(ctx, ba))
    }

    /// Periodically log transaction statistics. Only write transactions
    /// show up here; read-only transactions are stateless as far as the
    /// coordinator is concerned.
    async fn stats_loop(&self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + STATS_LOG_INTERVAL,
            STATS_LOG_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut prev_commits = self.metrics.commits.count();
        let mut prev_commits_1pc = self.metrics.commits_1pc.count();
        let mut prev_aborts = self.metrics.aborts.count();
        let mut prev_abandons = self.metrics.abandons.count();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Snapshots are not atomic across metrics; some skew is
                    // fine for debug stats.
                    let commits = self.metrics.commits.count();
                    let commits_1pc = self.metrics.commits_1pc.count();
                    let aborts = self.metrics.aborts.count();
                    let abandons = self.metrics.abandons.count();

                    let d_commits = (commits - prev_commits) as f64;
                    let d_commits_1pc = (commits_1pc - prev_commits_1pc) as f64;
                    let d_aborts = (aborts - prev_aborts) as f64;
                    let d_abandons = (abandons - prev_abandons) as f64;
                    prev_commits = commits;
                    prev_commits_1pc = commits_1pc;
                    prev_aborts = aborts;
                    prev_abandons = abandons;

                    let (durations, durations_window) = self.metrics.durations.windowed();
                    let (restarts, restarts_window) = self.metrics.restarts.windowed();
                    if durations_window != restarts_window {
                        warn!(
                            ?durations_window,
                            ?restarts_window,
                            "misconfigured windowed histograms"
                        );
                        continue;
                    }

                    let total = d_commits + d_aborts + d_abandons;
                    let rate = total / STATS_LOG_INTERVAL.as_secs_f64();
                    let (p_commit, p_commit_1pc, p_abort, p_abandon) = if total > 0.0 {
                        (
                            100.0 * d_commits / total,
                            100.0 * d_commits_1pc / total,
                            100.0 * d_aborts / total,
                            100.0 * d_abandons / total,
                        )
                    } else {
                        (0.0, 0.0, 0.0, 0.0)
                    };

                    info!(
                        "txn coordinator: {:.2} txn/sec, {:.2}/{:.2}/{:.2}/{:.2} %cmmt/cmmt1pc/abrt/abnd, \
                         {:.2}/{:.2}/{:.2} ms avg/\u{3c3}/max duration, {:.1}/{:.1}/{} avg/\u{3c3}/max restarts \
                         ({} samples over {:?})",
                        rate,
                        p_commit,
                        p_commit_1pc,
                        p_abort,
                        p_abandon,
                        durations.mean / 1e6,
                        durations.std_dev / 1e6,
                        durations.max as f64 / 1e6,
                        restarts.mean,
                        restarts.std_dev,
                        restarts.max,
                        durations.count,
                        durations_window,
                    );
                }
                _ = self.stopper.quiesced() => return,
            }
        }
    }
}

#[async_trait::async_trait]
impl Sender for Arc<TxnCoordinator> {
    async fn send(&self, ctx: &RequestContext, ba: BatchRequest) -> Result<BatchResponse> {
        self.send_batch(ctx, ba).await
    }
}
