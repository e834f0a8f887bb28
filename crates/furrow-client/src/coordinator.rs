//! Group membership and rebalancing.
//!
//! One [`GroupCoordinator`] runs per (group, topic) subscription on each
//! process. It keeps two loops alive:
//!
//! - the **heartbeat loop** proves this instance is alive by upserting its
//!   `consumer_instances` row every `heartbeat_interval`;
//! - the **rebalance loop** first blocks on the cluster-wide
//!   `rebalance_lock` advisory lock, then — as the elected rebalancer —
//!   recomputes the round-robin partition assignment every
//!   `rebalance_interval` and writes it only when it actually changed
//!   (SHA-256 fingerprint comparison).
//!
//! With a stable live set, the assignment is a pure function of the sorted
//! instance ids and the partition count, so every would-be rebalancer
//! converges on the same result. Committed offsets are never touched here;
//! only the owner column moves.
//!
//! Broadcast subscriptions run the heartbeat loop only: every broadcast
//! member consumes every partition, so there is nothing to assign and no
//! assignment rows are written for `__broadcast__*` groups.

use crate::{error::Result, CLUSTER_LOCK_WAIT};
use furrow_core::{
    is_broadcast_group, Config, ConsumerInstance, PartitionAssignment, REBALANCE_LOCK,
};
use furrow_store::BrokerStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Heartbeats one (group, topic) membership and, when elected, rebalances it.
#[derive(Clone)]
pub struct GroupCoordinator {
    store: Arc<dyn BrokerStore>,
    config: Config,
    group: String,
    topic: String,
    instance_id: String,
    hostname: String,
    shutdown: watch::Receiver<bool>,
}

/// Running coordinator tasks for one (group, topic).
pub struct CoordinatorHandle {
    pub group: String,
    pub topic: String,
    heartbeat: JoinHandle<()>,
    rebalance: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Waits for both loops to exit. Call after signalling shutdown.
    pub async fn join(self) {
        let _ = self.heartbeat.await;
        if let Some(rebalance) = self.rebalance {
            let _ = rebalance.await;
        }
    }
}

impl GroupCoordinator {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        config: Config,
        group: impl Into<String>,
        topic: impl Into<String>,
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            group: group.into(),
            topic: topic.into(),
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            shutdown,
        }
    }

    /// Starts the heartbeat loop, and the rebalance loop for non-broadcast
    /// groups.
    pub fn spawn(self) -> CoordinatorHandle {
        let group = self.group.clone();
        let topic = self.topic.clone();
        let rebalance = (!is_broadcast_group(&self.group))
            .then(|| tokio::spawn(self.clone().rebalance_loop()));
        let heartbeat = tokio::spawn(self.heartbeat_loop());
        CoordinatorHandle {
            group,
            topic,
            heartbeat,
            rebalance,
        }
    }

    async fn heartbeat_loop(mut self) {
        info!(group = %self.group, topic = %self.topic, "heartbeat loop started");
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                // First tick fires immediately, registering the instance
                // before the first rebalance pass can run.
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .store
                        .heartbeat(&self.group, &self.topic, &self.instance_id, &self.hostname)
                        .await
                    {
                        error!(
                            group = %self.group,
                            topic = %self.topic,
                            error = %e,
                            "heartbeat failed"
                        );
                    }
                }
            }
        }
        info!(group = %self.group, topic = %self.topic, "heartbeat loop stopped");
    }

    async fn rebalance_loop(mut self) {
        // Phase 1: win the cluster-wide election. Whoever holds the lock is
        // the only process writing assignments anywhere.
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return;
                    }
                }
                acquired = self.store.acquire_lock(REBALANCE_LOCK, CLUSTER_LOCK_WAIT) => {
                    match acquired {
                        Ok(true) => break,
                        Ok(false) => tokio::time::sleep(Duration::from_secs(1)).await,
                        Err(e) => {
                            error!(error = %e, "failed to acquire rebalance lock");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        info!(group = %self.group, topic = %self.topic, "elected rebalancer");

        // Phase 2: periodically recompute and apply the assignment.
        let mut last_fingerprint = String::new();
        let mut ticker = tokio::time::interval(self.config.rebalance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance_once(&mut last_fingerprint).await {
                        error!(
                            group = %self.group,
                            topic = %self.topic,
                            error = %e,
                            "rebalance pass failed"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        if let Err(e) = self.store.release_lock(REBALANCE_LOCK).await {
            warn!(error = %e, "failed to release rebalance lock");
        }
        info!(group = %self.group, topic = %self.topic, "rebalance loop stopped");
    }

    async fn rebalance_once(&self, last_fingerprint: &mut String) -> Result<()> {
        let instances = self
            .store
            .list_active_instances(&self.group, &self.topic, self.config.liveness_threshold())
            .await?;
        if instances.is_empty() {
            warn!(
                group = %self.group,
                topic = %self.topic,
                "no live instances, keeping previous assignment"
            );
            return Ok(());
        }
        let meta = self.store.get_or_create_topic(&self.topic).await?;
        let assignments =
            assign_round_robin(&self.group, &self.topic, &instances, meta.partition_num);
        let fingerprint = assignment_fingerprint(&assignments);
        if fingerprint == *last_fingerprint {
            debug!(group = %self.group, topic = %self.topic, "assignment unchanged");
            return Ok(());
        }
        info!(
            group = %self.group,
            topic = %self.topic,
            instances = instances.len(),
            partitions = meta.partition_num,
            "applying new partition assignment"
        );
        self.store.apply_assignments(&assignments).await?;
        *last_fingerprint = fingerprint;
        Ok(())
    }
}

/// Round-robin assignment over the live set: partition `p` goes to
/// `instances[p mod n]` with instance ids sorted ascending. Deterministic
/// for a fixed live set, so every elected rebalancer computes the same map.
///
/// Callers must pass a non-empty instance slice.
pub fn assign_round_robin(
    group: &str,
    topic: &str,
    instances: &[ConsumerInstance],
    partition_num: u32,
) -> Vec<PartitionAssignment> {
    let mut ids: Vec<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
    ids.sort_unstable();
    (0..partition_num)
        .map(|partition| PartitionAssignment {
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
            instance_id: ids[partition as usize % ids.len()].to_string(),
        })
        .collect()
}

/// SHA-256 over the partition-ordered `(partition, group, topic, owner)`
/// tuples. Equal fingerprints mean the write can be skipped entirely.
pub fn assignment_fingerprint(assignments: &[PartitionAssignment]) -> String {
    let mut ordered: Vec<&PartitionAssignment> = assignments.iter().collect();
    ordered.sort_by_key(|a| a.partition);
    let mut hasher = Sha256::new();
    for a in ordered {
        hasher.update(format!("{}:{}:{}:{}", a.partition, a.group, a.topic, a.instance_id));
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBrokerStore;
    use chrono::Utc;

    fn instance(id: &str) -> ConsumerInstance {
        ConsumerInstance {
            group: "g".into(),
            topic: "t".into(),
            instance_id: id.into(),
            hostname: "host".into(),
            active: true,
            heartbeat: Utc::now(),
        }
    }

    #[test]
    fn single_instance_owns_every_partition() {
        let assignments = assign_round_robin("g", "t", &[instance("s1")], 6);
        assert_eq!(assignments.len(), 6);
        assert!(assignments.iter().all(|a| a.instance_id == "s1"));
    }

    #[test]
    fn two_instances_alternate_partitions() {
        // Sorted ids: s1 < s2, so evens go to s1 and odds to s2.
        let assignments = assign_round_robin("g", "t", &[instance("s2"), instance("s1")], 6);
        for a in &assignments {
            let expected = if a.partition % 2 == 0 { "s1" } else { "s2" };
            assert_eq!(a.instance_id, expected, "partition {}", a.partition);
        }
    }

    #[test]
    fn assignment_ignores_input_order() {
        let forward = assign_round_robin("g", "t", &[instance("a"), instance("b")], 4);
        let reverse = assign_round_robin("g", "t", &[instance("b"), instance("a")], 4);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn joining_instance_moves_at_most_half_the_partitions() {
        let before = assign_round_robin("g", "t", &[instance("s1")], 6);
        let after = assign_round_robin("g", "t", &[instance("s1"), instance("s2")], 6);
        let moved = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b.instance_id != a.instance_id)
            .count();
        assert!(moved <= 3, "{moved} partitions moved");
    }

    #[test]
    fn fingerprint_is_stable_and_order_independent() {
        let a = assign_round_robin("g", "t", &[instance("s1"), instance("s2")], 4);
        let mut b = a.clone();
        b.reverse();
        assert_eq!(assignment_fingerprint(&a), assignment_fingerprint(&b));
        // Rebalance is idempotent: recomputing on an unchanged live set
        // produces an identical fingerprint.
        let again = assign_round_robin("g", "t", &[instance("s2"), instance("s1")], 4);
        assert_eq!(assignment_fingerprint(&a), assignment_fingerprint(&again));
    }

    #[test]
    fn fingerprint_changes_with_the_live_set() {
        let one = assign_round_robin("g", "t", &[instance("s1")], 4);
        let two = assign_round_robin("g", "t", &[instance("s1"), instance("s2")], 4);
        assert_ne!(assignment_fingerprint(&one), assignment_fingerprint(&two));
    }

    #[tokio::test]
    async fn coordinator_heartbeats_and_assigns() {
        let store = Arc::new(MemoryBrokerStore::new(4, 7));
        let config = Config::default()
            .heartbeat_interval(Duration::from_millis(20))
            .rebalance_interval(Duration::from_millis(20));
        let (tx, rx) = watch::channel(false);

        let handle = GroupCoordinator::new(
            store.clone() as Arc<dyn BrokerStore>,
            config,
            "g",
            "orders",
            "inst-1",
            "host-1",
            rx,
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let instances = store.list_instances("orders", Some("g")).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].active);

        let partitions = store
            .partitions_for_instance("g", "orders", "inst-1")
            .await
            .unwrap();
        assert_eq!(partitions, vec![0, 1, 2, 3]);

        tx.send(true).unwrap();
        handle.join().await;

        // Graceful stop marks the instance inactive at the broker layer, not
        // here; the coordinator only stops ticking. The advisory lock must
        // be free again though.
        assert!(store.acquire_lock(REBALANCE_LOCK, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_groups_never_write_assignments() {
        let store = Arc::new(MemoryBrokerStore::new(4, 7));
        store.get_or_create_topic("orders").await.unwrap();
        let config = Config::default()
            .heartbeat_interval(Duration::from_millis(20))
            .rebalance_interval(Duration::from_millis(20));
        let (tx, rx) = watch::channel(false);

        let group = format!("{}{}", furrow_core::BROADCAST_GROUP_PREFIX, "abc");
        let handle = GroupCoordinator::new(
            store.clone() as Arc<dyn BrokerStore>,
            config,
            group.clone(),
            "orders",
            "inst-1",
            "host-1",
            rx,
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Heartbeat row exists, offset table untouched.
        assert_eq!(store.list_instances("orders", Some(&group)).await.unwrap().len(), 1);
        assert!(store.list_offsets("orders", None).await.unwrap().is_empty());

        tx.send(true).unwrap();
        handle.join().await;
    }
}
