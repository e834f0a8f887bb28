//! The delay-message promoter.
//!
//! Exactly one promoter runs across the whole cluster: the task blocks on
//! the `delay_message_lock` advisory lock, and whoever wins it moves due
//! messages from the delay queue into the main store every
//! `delay_interval`.
//!
//! Per-row contract: a delay row is deleted only after its message was
//! saved (or found already saved), so every delayed message is promoted at
//! least once. A failure to delete after a successful save aborts the whole
//! batch rather than risking a second save next cycle; the unique
//! `message_id` key in the message tables turns that residual crash window
//! into a handled `DuplicateMessage` instead of a double delivery.

use crate::error::Result;
use crate::CLUSTER_LOCK_WAIT;
use furrow_core::{Config, DELAY_MESSAGE_LOCK};
use furrow_store::{BrokerStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Cluster-singleton task that promotes due delay messages.
pub struct DelayPromoter {
    store: Arc<dyn BrokerStore>,
    config: Config,
    shutdown: watch::Receiver<bool>,
}

impl DelayPromoter {
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

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                acquired = self.store.acquire_lock(DELAY_MESSAGE_LOCK, CLUSTER_LOCK_WAIT) => {
                    match acquired {
                        Ok(true) => break,
                        Ok(false) => tokio::time::sleep(Duration::from_secs(1)).await,
                        Err(e) => {
                            error!(error = %e, "failed to acquire delay message lock");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        info!("elected delay promoter");

        let mut ticker = tokio::time::interval(self.config.delay_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.promote_due().await {
                        error!(error = %e, "delay promotion cycle failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        if let Err(e) = self.store.release_lock(DELAY_MESSAGE_LOCK).await {
            warn!(error = %e, "failed to release delay message lock");
        }
        info!("delay promoter stopped");
    }

    /// Promotes one batch of due messages. Save failures skip the row for
    /// this cycle; delete failures abort the batch.
    pub(crate) async fn promote_due(&self) -> Result<()> {
        let due = self
            .store
            .fetch_due_delay_messages(self.config.polling_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        let mut promoted = 0u32;
        for delayed in due {
            match self.store.save_message(delayed.message.clone()).await {
                Ok(_) => {}
                Err(StoreError::DuplicateMessage(id)) => {
                    // A previous promoter crashed between save and delete;
                    // the copy already exists, so just clean up the row.
                    debug!(message_id = %id, "delay message already promoted");
                }
                Err(e) => {
                    error!(
                        id = delayed.id,
                        topic = %delayed.message.topic,
                        error = %e,
                        "failed to promote delay message, skipping this cycle"
                    );
                    continue;
                }
            }
            self.store.delete_delay_message(delayed.id).await?;
            promoted += 1;
        }
        if promoted > 0 {
            debug!(promoted, "promoted due delay messages");
        }
        Ok(())
    }
}
