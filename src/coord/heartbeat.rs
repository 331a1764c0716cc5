//! Per-transaction heartbeating and cleanup
//!
//! Every tracked transaction owns one heartbeat task that keeps the
//! server-side record live and watches for the client going away. Losing
//! the heartbeat means the transaction must be assumed aborted: the task
//! marks the local record accordingly and fires an asynchronous abort so
//! the accumulated intents get cleaned up.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::coord::coordinator::TxnCoordinator;
use crate::coord::metadata::TxnMetadata;
use crate::protocol::{
    merge_spans, BatchRequest, EndTxnRequest, Request, Response, TxnId, TxnStatus,
};

impl TxnCoordinator {
    /// Periodically heartbeat the transaction record, stopping once the
    /// transaction finalizes, the client goes away, or the node quiesces.
    /// On exit the record is unregistered and accounted for.
    pub(crate) async fn heartbeat_loop(self: Arc<Self>, ctx: RequestContext, txn_id: TxnId) {
        let interval = self.config.heartbeat_interval;
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let closer = {
            let txns = self.txns.lock();
            txns.get(&txn_id).and_then(|meta| meta.txn_end.clone())
        };

        // The signal may already be closed if the transaction finished
        // before this task got a chance to start.
        if let Some(closer) = closer {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !self.heartbeat(&ctx, txn_id).await {
                            break;
                        }
                    }
                    _ = closer.notified() => {
                        // Transaction finished normally.
                        break;
                    }
                    _ = ctx.cancelled() => {
                        self.try_async_abort(txn_id);
                        break;
                    }
                    _ = self.stopper.quiesced() => break,
                }
            }
        }

        let (duration, restarts, status) = {
            let mut txns = self.txns.lock();
            self.unregister_txn_locked(&mut txns, txn_id)
        };
        self.update_stats(duration, restarts, status, false);
    }

    /// One heartbeat round. Returns false when the task should exit.
    async fn heartbeat(&self, ctx: &RequestContext, txn_id: TxnId) -> bool {
        let (mut txn, has_abandoned) = {
            let txns = self.txns.lock();
            let Some(meta) = txns.get(&txn_id) else {
                panic!("heartbeat for untracked transaction: {txn_id}");
            };
            (
                meta.txn.clone(),
                meta.has_client_abandoned(self.clock.physical_now()),
            )
        };

        if txn.status != TxnStatus::Pending {
            // A previous round already saw the record finalized. Keep the
            // state so the client gets the right error on its next request.
            return true;
        }

        // A cancellable context owns the client-gone decision; otherwise
        // the abandonment timeout does.
        if !ctx.is_cancellable() && has_abandoned {
            info!(txn = %txn, "transaction abandoned; stopping heartbeat");
            self.try_async_abort(txn_id);
            return false;
        }

        let hb = BatchRequest::with_txn(
            txn.clone(),
            vec![Request::HeartbeatTxn {
                key: txn.key.clone(),
                now: self.clock.now(),
            }],
        );

        debug!(txn = %txn.id, "heartbeat");
        match self.wrapped.send(ctx, hb).await {
            Err(err) => {
                // Without a reachable transaction record the client must
                // not keep going; assume the worst and clean up.
                warn!(txn = %txn, error = %err, "heartbeat failed");
                self.try_async_abort(txn_id);
                txn.status = TxnStatus::Aborted;
            }
            Ok(br) => {
                if let Some(Response::HeartbeatTxn { txn: resp_txn }) = br.responses.first() {
                    txn.update(resp_txn);
                } else if let Some(br_txn) = &br.txn {
                    txn.update(br_txn);
                }
            }
        }

        // Hand the news to the tracked record. Long-running transactions
        // learn about restarts this way, and in particular notice when they
        // have been aborted.
        {
            let mut txns = self.txns.lock();
            if let Some(meta) = txns.get_mut(&txn_id) {
                meta.txn.update(&txn);
            }
        }

        true
    }

    /// Snapshot the record's proto and intents, clear the intents, and
    /// abort the transaction on a background task. A no-op unless the
    /// transaction is still pending.
    pub(crate) fn try_async_abort(&self, txn_id: TxnId) {
        let (intents, txn) = {
            let mut txns = self.txns.lock();
            let Some(meta) = txns.get_mut(&txn_id) else {
                return;
            };
            let (intents, _) = merge_spans(&meta.keys);
            // Clearing the intents keeps a racing second abort from
            // resending them.
            meta.keys.clear();
            (intents, meta.txn.clone())
        };

        if txn.status != TxnStatus::Pending {
            return;
        }

        let ba = BatchRequest::with_txn(
            txn.clone(),
            vec![Request::EndTxn(EndTxnRequest {
                commit: false,
                key: Some(txn.key.clone()),
                intent_spans: intents,
            })],
        );

        // Dispatch through the wrapped sender directly; the gate would
        // reject client-supplied intents. The caller's context may already
        // be cancelled, so the abort runs under a background context.
        let wrapped = Arc::clone(&self.wrapped);
        let spawned = self.stopper.spawn("txn coordinator abort", async move {
            let ctx = RequestContext::background();
            if let Err(err) = wrapped.send(&ctx, ba).await {
                warn!(txn = %txn, error = %err, "abort due to inactivity failed");
            }
        });
        if let Err(err) = spawned {
            warn!(error = %err, "could not spawn abort task");
        }
    }

    /// Remove the record and collect its stats. Panics if the record is
    /// missing; only the owning heartbeat task unregisters.
    pub(crate) fn unregister_txn_locked(
        &self,
        txns: &mut HashMap<TxnId, TxnMetadata>,
        txn_id: TxnId,
    ) -> (i64, i64, TxnStatus) {
        let Some(meta) = txns.remove(&txn_id) else {
            panic!("attempt to unregister non-existent transaction: {txn_id}");
        };
        let duration = self.clock.physical_now() - meta.first_update_nanos;
        (duration, i64::from(meta.txn.epoch), meta.txn.status)
    }

    /// Account for a finished transaction.
    pub(crate) fn update_stats(
        &self,
        duration: i64,
        restarts: i64,
        status: TxnStatus,
        one_phase_commit: bool,
    ) {
        self.metrics.durations.record(duration);
        self.metrics.restarts.record(restarts);
        match status {
            TxnStatus::Aborted => self.metrics.aborts.inc(),
            // Exiting while still pending means the client went away.
            TxnStatus::Pending => self.metrics.abandons.inc(),
            TxnStatus::Committed => {
                self.metrics.commits.inc();
                if one_phase_commit {
                    self.metrics.commits_1pc.inc();
                }
            }
        }
    }
}
