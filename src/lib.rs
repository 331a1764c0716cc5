#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Keyline transaction coordination
//!
//! Client-side transaction coordination for the Keyline distributed
//! key-value store. The [`coord::TxnCoordinator`] sits between a KV client
//! and the lower-level request dispatcher as a man-in-the-middle:
//!
//! - once a transaction starts writing, it heartbeats the server-side
//!   transaction record to keep it live
//! - it tracks every key span written through it and attaches the merged
//!   set to the eventual commit, so replicas can resolve the intents
//! - it reclassifies retryable server errors into prepared next attempts
//! - it rolls back transactions whose clients have gone away
//!
//! The dispatcher being wrapped, the clock, and the stop signal are all
//! injected, so the coordinator stacks on top of anything that implements
//! [`Sender`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use keyline::clock::Clock;
//! use keyline::coord::{ClusterSettings, CoordinatorConfig, TxnCoordinator, TxnMetrics};
//! use keyline::protocol::{BatchRequest, BatchResponse, Request, Transaction};
//! use keyline::stopper::Stopper;
//! use keyline::{RequestContext, Result, Sender};
//!
//! /// Stand-in for the real dispatcher.
//! struct Loopback;
//!
//! #[async_trait]
//! impl Sender for Loopback {
//!     async fn send(&self, _ctx: &RequestContext, ba: BatchRequest) -> Result<BatchResponse> {
//!         Ok(BatchResponse::ack(&ba))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let clock = Arc::new(Clock::system(Duration::from_millis(250)));
//!     let coordinator = TxnCoordinator::new(
//!         Arc::new(Loopback),
//!         Arc::clone(&clock),
//!         CoordinatorConfig::default(),
//!         Arc::new(ClusterSettings::default()),
//!         Stopper::new(),
//!         TxnMetrics::default(),
//!     );
//!
//!     let txn = Transaction::new("example", Bytes::from_static(b"k"), 1.0, clock.now());
//!     let ba = BatchRequest::with_txn(
//!         txn.clone(),
//!         vec![
//!             Request::BeginTxn { key: txn.key.clone() },
//!             Request::Put {
//!                 key: Bytes::from_static(b"k"),
//!                 value: Bytes::from_static(b"v"),
//!             },
//!         ],
//!     );
//!     let ctx = RequestContext::background();
//!     let br = coordinator.send_batch(&ctx, ba).await?;
//!     assert!(br.txn.is_some());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod context;
pub mod coord;
pub mod error;
pub mod protocol;
pub mod stopper;

pub use context::{CancelHandle, RequestContext};
pub use coord::{Sender, TxnCoordinator};
pub use error::{ErrorDetail, KeylineError, Result, RetryReason};
