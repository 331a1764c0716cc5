//! The dispatch seam
//!
//! Both the transaction coordinator and the dispatcher it wraps speak this
//! interface, so coordinators stack on top of whatever routes batches to
//! replicas. Implementations must be safe for concurrent invocation.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;
use crate::protocol::{BatchRequest, BatchResponse};

/// Something that can execute a batch.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Execute `ba`, returning its responses or a structured error. Either
    /// way, the result carries an updated transaction proto when the batch
    /// was transactional.
    async fn send(&self, ctx: &RequestContext, ba: BatchRequest) -> Result<BatchResponse>;
}
