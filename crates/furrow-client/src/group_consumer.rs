//! Reconciling partition workers against the assignment table.
//!
//! One [`GroupConsumer`] runs per (topic, group) subscription on a process.
//! On every refresh tick it reads the partitions currently assigned to this
//! instance and diffs them against the workers it has running: newly
//! assigned partitions get a worker, partitions that moved away get their
//! worker stopped and joined. The reconcile is idempotent and cheap, so
//! concurrent assignment churn converges within one refresh period.
//!
//! For broadcast groups the assignment table is not consulted at all: the
//! target set is simply every partition of the topic.

use crate::error::Result;
use crate::partition_worker::{PartitionWorker, WorkerHandle};
use crate::SharedHandler;
use furrow_core::{is_broadcast_group, Config};
use furrow_store::BrokerStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Keeps this instance's set of partition workers in sync with the
/// assignment table.
pub struct GroupConsumer {
    store: Arc<dyn BrokerStore>,
    config: Config,
    group: String,
    topic: String,
    instance_id: String,
    handler: SharedHandler,
    shutdown: watch::Receiver<bool>,
    workers: HashMap<u32, WorkerHandle>,
}

/// Join handle for a running group consumer.
pub(crate) struct GroupConsumerHandle {
    task: JoinHandle<()>,
}

impl GroupConsumerHandle {
    /// Waits for the consumer (and all its workers) to stop. Call after
    /// signalling shutdown.
    pub(crate) async fn join(self) {
        let _ = self.task.await;
    }
}

impl GroupConsumer {
    pub(crate) fn new(
        store: Arc<dyn BrokerStore>,
        config: Config,
        group: impl Into<String>,
        topic: impl Into<String>,
        instance_id: impl Into<String>,
        handler: SharedHandler,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            group: group.into(),
            topic: topic.into(),
            instance_id: instance_id.into(),
            handler,
            shutdown,
            workers: HashMap::new(),
        }
    }

    pub(crate) fn spawn(self) -> GroupConsumerHandle {
        GroupConsumerHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(mut self) {
        info!(group = %self.group, topic = %self.topic, "group consumer started");
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(
                            group = %self.group,
                            topic = %self.topic,
                            error = %e,
                            "partition reconcile failed"
                        );
                    }
                }
            }
        }
        for (partition, handle) in self.workers.drain() {
            debug!(partition, "stopping partition worker");
            handle.stop().await;
        }
        info!(group = %self.group, topic = %self.topic, "group consumer stopped");
    }

    async fn reconcile(&mut self) -> Result<()> {
        let target: BTreeSet<u32> = if is_broadcast_group(&self.group) {
            let meta = self.store.get_or_create_topic(&self.topic).await?;
            (0..meta.partition_num).collect()
        } else {
            self.store
                .partitions_for_instance(&self.group, &self.topic, &self.instance_id)
                .await?
                .into_iter()
                .collect()
        };
        let running: BTreeSet<u32> = self.workers.keys().copied().collect();
        let (to_start, to_stop) = reconcile_diff(&target, &running);

        for partition in to_start {
            debug!(
                group = %self.group,
                topic = %self.topic,
                partition,
                "starting partition worker"
            );
            let handle = PartitionWorker::spawn(
                Arc::clone(&self.store),
                self.config.clone(),
                self.group.clone(),
                self.topic.clone(),
                partition,
                self.instance_id.clone(),
                Arc::clone(&self.handler),
            );
            self.workers.insert(partition, handle);
        }
        for partition in to_stop {
            debug!(
                group = %self.group,
                topic = %self.topic,
                partition,
                "partition no longer assigned, stopping worker"
            );
            if let Some(handle) = self.workers.remove(&partition) {
                handle.stop().await;
            }
        }
        Ok(())
    }
}

/// Partitions to start and to stop, given the assigned target set and the
/// currently running set.
pub(crate) fn reconcile_diff(
    target: &BTreeSet<u32>,
    running: &BTreeSet<u32>,
) -> (Vec<u32>, Vec<u32>) {
    let to_start = target.difference(running).copied().collect();
    let to_stop = running.difference(target).copied().collect();
    (to_start, to_stop)
}
