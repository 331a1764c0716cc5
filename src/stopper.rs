//! Process-lifetime stop signal
//!
//! The [`Stopper`] is the one handle background tasks hold on the life of
//! the node. Heartbeat tasks and the stats logger select on
//! [`Stopper::quiesced`] and exit without further dispatch once quiescing
//! begins; [`Stopper::spawn`] refuses new tasks on a draining node.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{ErrorDetail, KeylineError, Result};

#[derive(Debug)]
struct StopperInner {
    quiescing: AtomicBool,
    tx: watch::Sender<bool>,
}

/// Cloneable handle to the node's stop signal.
#[derive(Debug, Clone)]
pub struct Stopper {
    inner: Arc<StopperInner>,
}

impl Stopper {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(StopperInner {
                quiescing: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Spawn a background task, unless the node is already draining.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_quiescing() {
            debug!(task = name, "refusing task spawn while draining");
            return Err(KeylineError::new(ErrorDetail::Draining));
        }
        tokio::spawn(fut);
        Ok(())
    }

    /// Begin quiescing. Idempotent.
    pub fn quiesce(&self) {
        if !self.inner.quiescing.swap(true, Ordering::SeqCst) {
            debug!("quiesce initiated");
            let _ = self.inner.tx.send(true);
        }
    }

    pub fn is_quiescing(&self) -> bool {
        self.inner.quiescing.load(Ordering::SeqCst)
    }

    /// Resolves once quiescing has begun.
    pub async fn quiesced(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|quiescing| *quiescing).await;
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}
