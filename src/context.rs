//! Request contexts
//!
//! A [`RequestContext`] rides along with every batch. Cancellable contexts
//! let the client abandon a request (and with it, transaction heartbeating)
//! explicitly; background contexts cannot be cancelled, in which case the
//! heartbeat task falls back to the abandonment timeout to decide that the
//! client has gone away.

use tokio::sync::watch;

/// Context accompanying a batch through the coordinator.
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle that cancels the paired [`RequestContext`]. Dropping the handle
/// also cancels the context.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl RequestContext {
    /// A context that can never be cancelled.
    pub fn background() -> Self {
        Self { cancel: None }
    }

    /// A cancellable context plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { cancel: Some(rx) }, CancelHandle { tx })
    }

    /// Whether this context can be cancelled at all.
    pub fn is_cancellable(&self) -> bool {
        self.cancel.is_some()
    }

    /// Resolves when the context is cancelled. Never resolves for a
    /// background context.
    pub async fn cancelled(&self) {
        match &self.cancel {
            None => std::future::pending::<()>().await,
            Some(rx) => {
                let mut rx = rx.clone();
                // A closed channel means the handle was dropped, which
                // counts as cancellation.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
        }
    }
}

impl CancelHandle {
    /// Cancel the paired context.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
