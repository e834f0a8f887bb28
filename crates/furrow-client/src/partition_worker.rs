//! The per-partition pull loop.
//!
//! A [`PartitionWorker`] owns exactly one (group, topic, partition) on its
//! instance. Each iteration it resolves its position, fetches a bounded
//! page, pushes every message through the handler (with retries and
//! dead-letter fallback), and advances:
//!
//! - **Group mode**: the position is the committed offset in
//!   `consumer_offsets`, and every processed message is committed back with
//!   an ownership-guarded update. A commit that matches zero rows means a
//!   rebalance took the partition away, so the worker abandons the batch;
//!   the group consumer will retire it on the next reconcile.
//! - **Broadcast mode**: the position is an in-memory cursor seeded from the
//!   partition's max offset at subscription time (history is skipped), and
//!   nothing is ever persisted.
//!
//! Delivery is at-least-once in group mode: the handler runs before the
//! commit, so a crash between the two replays the message to the next owner.

use crate::error::Result;
use crate::{HandlerError, SharedHandler};
use furrow_core::{is_broadcast_group, Config, Message};
use furrow_store::{BrokerStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pull loop for one assigned partition.
pub struct PartitionWorker {
    store: Arc<dyn BrokerStore>,
    config: Config,
    group: String,
    topic: String,
    partition: u32,
    instance_id: String,
    handler: SharedHandler,
    stop: watch::Receiver<bool>,
}

/// Stop control for a running worker.
pub(crate) struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals the worker and waits for it to wind down.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

impl PartitionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        store: Arc<dyn BrokerStore>,
        config: Config,
        group: String,
        topic: String,
        partition: u32,
        instance_id: String,
        handler: SharedHandler,
    ) -> WorkerHandle {
        let (tx, rx) = watch::channel(false);
        let worker = Self {
            store,
            config,
            group,
            topic,
            partition,
            instance_id,
            handler,
            stop: rx,
        };
        WorkerHandle {
            stop: tx,
            task: tokio::spawn(worker.run()),
        }
    }

    async fn run(mut self) {
        debug!(
            group = %self.group,
            topic = %self.topic,
            partition = self.partition,
            "partition worker started"
        );
        let broadcast = is_broadcast_group(&self.group);
        // Broadcast position; `None` until seeded from the max offset.
        let mut cursor: Option<i64> = None;
        loop {
            if *self.stop.borrow() {
                break;
            }
            let started = Instant::now();
            if let Err(e) = self.poll_once(broadcast, &mut cursor).await {
                error!(
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "partition poll failed"
                );
                if self.sleep_or_stop(Duration::from_secs(1)).await {
                    break;
                }
            }
            // Pace the loop so one iteration takes at least pulling_interval.
            let elapsed = started.elapsed();
            if elapsed < self.config.pulling_interval
                && self
                    .sleep_or_stop(self.config.pulling_interval - elapsed)
                    .await
            {
                break;
            }
        }
        info!(
            group = %self.group,
            topic = %self.topic,
            partition = self.partition,
            "partition worker stopped"
        );
    }

    /// Sleeps for `duration` unless stopped first. Returns `true` to stop.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.stop.changed() => changed.is_err() || *self.stop.borrow(),
        }
    }

    async fn poll_once(&mut self, broadcast: bool, cursor: &mut Option<i64>) -> Result<()> {
        let after = if broadcast {
            match *cursor {
                Some(position) => position,
                None => {
                    // First iteration: skip history, start at the end.
                    let max = self.store.max_offset(&self.topic, self.partition).await?;
                    *cursor = Some(max);
                    max
                }
            }
        } else {
            self.store
                .committed_offset(&self.group, &self.topic, self.partition, &self.instance_id)
                .await?
                .unwrap_or(0)
        };

        let messages = self
            .store
            .fetch_messages(&self.topic, self.partition, after, self.config.polling_size)
            .await?;

        for msg in messages {
            if *self.stop.borrow() {
                return Ok(());
            }
            let offset = msg.offset;
            if let Err(e) = self.handle_with_retry(&msg).await {
                warn!(
                    message_id = %msg.message_id,
                    topic = %self.topic,
                    partition = self.partition,
                    error = %e,
                    "handler exhausted retries, routing to dead letter"
                );
                if let Err(e) = self.store.save_dead_letter(&msg).await {
                    // Not fatal: the offset still advances, which is the
                    // documented trade-off to keep the partition moving.
                    error!(
                        message_id = %msg.message_id,
                        error = %e,
                        "dead-letter write failed"
                    );
                }
            }
            if broadcast {
                *cursor = Some(offset);
            } else {
                match self
                    .store
                    .commit_offset(
                        &self.group,
                        &self.topic,
                        self.partition,
                        &self.instance_id,
                        offset,
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::LostOwnership) => {
                        info!(
                            group = %self.group,
                            topic = %self.topic,
                            partition = self.partition,
                            "partition reassigned mid-batch, yielding"
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Runs the handler up to `retry_times` total attempts, pausing
    /// `retry_interval` between them.
    async fn handle_with_retry(&self, msg: &Message) -> std::result::Result<(), HandlerError> {
        let attempts = self.config.retry_times.max(1);
        let mut attempt = 1;
        loop {
            match (self.handler)(msg.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt,
                        attempts,
                        message_id = %msg.message_id,
                        error = %e,
                        "message handler failed"
                    );
                    if attempt >= attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }
}
