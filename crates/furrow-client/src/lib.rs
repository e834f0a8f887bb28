//! Furrow client: producing, subscribing, and the coordination engine.
//!
//! This crate is the user-facing half of furrow. A [`Broker`] wraps a
//! [`BrokerStore`](furrow_store::BrokerStore) and runs the background
//! machinery a live broker node needs:
//!
//! - [`Producer`]: synchronous and fire-and-forget sends, routing delayed
//!   messages through the delay queue
//! - [`coordinator::GroupCoordinator`]: per-(group, topic) heartbeats and
//!   the leader-elected round-robin rebalancer
//! - [`group_consumer::GroupConsumer`]: reconciles running partition workers
//!   against the assignment table
//! - [`partition_worker::PartitionWorker`]: the per-partition pull loop with
//!   handler retries, dead-lettering, and guarded offset commits
//! - [`promoter::DelayPromoter`]: the cluster-singleton that moves due
//!   delayed messages into the main store
//! - [`reaper::Reaper`]: retention deletes and stale-instance eviction
//!
//! ## Example
//!
//! ```ignore
//! use furrow_client::{Broker, Config, Message};
//!
//! let broker = Broker::connect(Config::default().dsn(dsn)).await?;
//!
//! broker
//!     .group_subscribe("orders", "billing", |msg: Message| async move {
//!         println!("got {} bytes", msg.body.len());
//!         Ok(())
//!     })
//!     .await?;
//!
//! let id = broker
//!     .send_sync(Message::new("orders").key("user-42").body(b"hi".to_vec()))
//!     .await?;
//! ```

pub mod broker;
pub mod coordinator;
pub mod error;
pub mod group_consumer;
pub mod partition_worker;
pub mod producer;
pub mod promoter;
pub mod reaper;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::Broker;
pub use error::{ClientError, Result};
pub use producer::Producer;

// The types users touch every day, re-exported for convenience.
pub use furrow_core::{Config, Message, MessagePage, MessageQuery, PartitionStat, TopicMeta};

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Error type message handlers may return. Any error triggers the retry
/// policy and, once retries are exhausted, dead-lettering.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased message handler shared across partition workers.
pub(crate) type SharedHandler =
    Arc<dyn Fn(Message) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// How long lock acquisition waits for the cluster-wide advisory locks.
/// Ten years: effectively "block until elected or shut down".
pub(crate) const CLUSTER_LOCK_WAIT: Duration = Duration::from_secs(315_360_000);
