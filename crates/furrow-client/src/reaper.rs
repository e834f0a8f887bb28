//! Retention and instance reaping.
//!
//! Two independent periodic jobs, both cheap and idempotent, so they run on
//! every process without any cluster lock:
//!
//! - the **retention reaper** deletes messages older than each topic's
//!   retention from every partition;
//! - the **instance reaper** deletes consumer-instance rows that are
//!   inactive or whose heartbeat went stale. A live instance heartbeats
//!   itself straight back into existence, so this only ever frees slots.

use crate::error::Result;
use furrow_core::Config;
use furrow_store::BrokerStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Periodic retention and instance cleanup.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn BrokerStore>,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        config: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    /// Starts both reaper loops.
    pub(crate) fn spawn(self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().retention_loop()),
            tokio::spawn(self.instance_loop()),
        ]
    }

    async fn retention_loop(mut self) {
        let mut ticker = tokio::time::interval(self.config.clear_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        error!(error = %e, "retention pass failed");
                    }
                }
            }
        }
        info!("retention reaper stopped");
    }

    async fn instance_loop(mut self) {
        let mut ticker = tokio::time::interval(self.config.clear_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.store.reap_instances(self.config.liveness_threshold()).await {
                        Ok(reaped) if reaped > 0 => {
                            debug!(reaped, "evicted stale consumer instances");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "instance reap failed"),
                    }
                }
            }
        }
        info!("instance reaper stopped");
    }

    /// One retention pass over every partition of every topic. Failures are
    /// per-partition: one bad table does not stop the sweep.
    pub(crate) async fn purge_expired(&self) -> Result<()> {
        for topic in self.store.list_topics().await? {
            for partition in 0..topic.partition_num {
                match self
                    .store
                    .purge_expired_messages(&topic.topic, partition, topic.retention_days)
                    .await
                {
                    Ok(purged) if purged > 0 => {
                        debug!(topic = %topic.topic, partition, purged, "purged expired messages");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            topic = %topic.topic,
                            partition,
                            error = %e,
                            "failed to purge partition"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
