//! Furrow persistence layer.
//!
//! Everything furrow knows lives in a shared MySQL-compatible database: the
//! per-partition append-only message logs, the delay queue, topic metadata,
//! consumer-group membership, and committed offsets. This crate defines the
//! [`BrokerStore`] trait covering all of it, plus the production
//! implementation [`MySqlBrokerStore`].
//!
//! ## Why one trait?
//!
//! The consumption engine (heartbeats, rebalancing, partition workers, the
//! delay promoter, the reaper) only ever talks to `Arc<dyn BrokerStore>`.
//! That seam keeps the engine testable against an in-memory store and keeps
//! every piece of SQL in one crate.
//!
//! ## Coordination primitives
//!
//! Beyond plain rows, the store exposes named advisory locks
//! ([`BrokerStore::acquire_lock`]) with `GET_LOCK` semantics: exclusive
//! across the cluster, scoped to a database session, released automatically
//! when the session dies. They elect the single rebalancer and the single
//! delay promoter.
//!
//! ## Schema
//!
//! | Table | Contents |
//! |---|---|
//! | `topic_metas` | topic name, partition count, retention days |
//! | `messages_<topic>_<partition>` | one append-only log per partition, lazily created |
//! | `delay_messages` | future-dated messages indexed by `deliver_at` |
//! | `consumer_instances` | heartbeating subscriber processes |
//! | `consumer_offsets` | partition owner + committed offset, one row per (group, topic, partition) |

pub mod error;
pub mod mysql;

pub use error::{Result, StoreError};
pub use mysql::{MySqlBrokerStore, TopicDefaults};

use async_trait::async_trait;
use furrow_core::{
    ConsumerInstance, ConsumerOffset, DelayMessage, Message, MessagePage, MessageQuery,
    PartitionAssignment, PartitionStat, TopicMeta,
};
use std::time::Duration;

/// The complete persistence and coordination surface of a furrow broker.
///
/// All methods are cancel-safe at the database-call boundary and safe to
/// call concurrently; implementations must be `Send + Sync` and are shared
/// as `Arc<dyn BrokerStore>`.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    // ------------------------------------------------------------------
    // Topic registry
    // ------------------------------------------------------------------

    /// Returns the topic's metadata, creating the topic with the configured
    /// defaults if it does not exist yet (first-produce auto-creation).
    ///
    /// # Errors
    ///
    /// `InvalidTopic` when the name fails validation.
    async fn get_or_create_topic(&self, topic: &str) -> Result<TopicMeta>;

    /// Returns the topic's metadata, or `None` if it was never created.
    async fn get_topic(&self, topic: &str) -> Result<Option<TopicMeta>>;

    /// Lists all topics, sorted by name.
    async fn list_topics(&self) -> Result<Vec<TopicMeta>>;

    /// Creates a topic explicitly. `TopicExists` if the name is taken.
    async fn create_topic(&self, meta: &TopicMeta) -> Result<()>;

    /// Updates partition count and retention. `TopicNotFound` if absent.
    ///
    /// Raising the partition count is forward-only and lossy: existing
    /// messages stay where the old modulus put them.
    async fn update_topic(&self, meta: &TopicMeta) -> Result<()>;

    /// Deletes a topic: refuses with `TopicInUse` while any instance with a
    /// heartbeat younger than `liveness` references it, then drops every
    /// partition table, clears the topic's offset rows, and finally removes
    /// the metadata row.
    ///
    /// The steps are not atomic; the documented order (data first, metadata
    /// last) means a crash leaves orphans that a retry cleans up.
    async fn delete_topic(&self, topic: &str, liveness: Duration) -> Result<()>;

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    /// Appends a message to its partition's log and returns the message id.
    ///
    /// Assigns a fresh id when `message_id` is empty, derives the partition
    /// from the routing key, and lazily creates the partition table on first
    /// use. `DuplicateMessage` if the id already exists in the partition.
    async fn save_message(&self, msg: Message) -> Result<String>;

    /// Appends a copy of an exhausted message to its dead-letter topic,
    /// preserving id, key, tag, body, born time, and partition. Idempotent:
    /// a second dead-letter of the same id is a no-op.
    async fn save_dead_letter(&self, msg: &Message) -> Result<String>;

    /// Returns up to `limit` messages with offsets strictly greater than
    /// `after_offset`, in offset order. A missing partition table reads as
    /// empty.
    async fn fetch_messages(
        &self,
        topic: &str,
        partition: u32,
        after_offset: i64,
        limit: u32,
    ) -> Result<Vec<Message>>;

    /// Min/max offset and total count for one partition. All zero when the
    /// partition table does not exist yet.
    async fn partition_stat(&self, topic: &str, partition: u32) -> Result<PartitionStat>;

    /// Highest offset in the partition, or 0 when empty/missing.
    async fn max_offset(&self, topic: &str, partition: u32) -> Result<i64> {
        Ok(self.partition_stat(topic, partition).await?.max_offset)
    }

    /// Lowest offset in the partition, or 0 when empty/missing.
    async fn min_offset(&self, topic: &str, partition: u32) -> Result<i64> {
        Ok(self.partition_stat(topic, partition).await?.min_offset)
    }

    /// Number of messages currently stored in the partition.
    async fn message_total(&self, topic: &str, partition: u32) -> Result<i64> {
        Ok(self.partition_stat(topic, partition).await?.total)
    }

    /// Drops one partition's table. Used only by topic deletion.
    async fn drop_partition(&self, topic: &str, partition: u32) -> Result<()>;

    /// Admin paging query over a topic's messages, optionally filtered by
    /// partition, message id, or tag. Newest first. Not a hot path.
    async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage>;

    // ------------------------------------------------------------------
    // Delay queue
    // ------------------------------------------------------------------

    /// Parks a message in the delay queue with
    /// `deliver_at = born_time + delay`. Returns the message id.
    async fn add_delay_message(&self, msg: Message) -> Result<String>;

    /// Returns up to `limit` delay messages whose `deliver_at` has passed,
    /// oldest due first.
    async fn fetch_due_delay_messages(&self, limit: u32) -> Result<Vec<DelayMessage>>;

    /// Removes one promoted row from the delay queue.
    async fn delete_delay_message(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Group membership
    // ------------------------------------------------------------------

    /// Upserts this instance's row: `heartbeat = now, active = true`.
    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
        hostname: &str,
    ) -> Result<()>;

    /// Marks the instance inactive (graceful stop). The reaper deletes the
    /// row later.
    async fn mark_instance_inactive(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<()>;

    /// Lists instances of a group that are active and have heartbeated
    /// within `liveness`, sorted by instance id. This ordering is what makes
    /// round-robin assignment a pure function of the live set.
    async fn list_active_instances(
        &self,
        group: &str,
        topic: &str,
        liveness: Duration,
    ) -> Result<Vec<ConsumerInstance>>;

    /// Admin view of all instances for a topic, optionally one group.
    async fn list_instances(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Vec<ConsumerInstance>>;

    // ------------------------------------------------------------------
    // Assignment and offsets
    // ------------------------------------------------------------------

    /// Applies a rebalance result in one transaction: per partition, update
    /// the owner column, inserting the row with `offset = -1` if it does not
    /// exist. A concurrent insert's duplicate-key error is swallowed; the
    /// winner's row is authoritative. Committed offsets are never touched.
    async fn apply_assignments(&self, assignments: &[PartitionAssignment]) -> Result<()>;

    /// Committed offset for a partition, as seen by its current owner.
    /// `None` when the row does not exist or is owned by someone else.
    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
    ) -> Result<Option<i64>>;

    /// Commits `offset` for a partition, guarded by ownership: the update is
    /// conditional on `instance_id` still being the assigned owner, and a
    /// zero-row match surfaces as `LostOwnership`.
    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
        offset: i64,
    ) -> Result<()>;

    /// Partitions currently assigned to one instance for (group, topic).
    async fn partitions_for_instance(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<Vec<u32>>;

    /// Admin view of offset rows for a topic, optionally one group.
    async fn list_offsets(&self, topic: &str, group: Option<&str>) -> Result<Vec<ConsumerOffset>>;

    /// Removes all offset rows for a topic. Used by topic deletion.
    async fn delete_offsets_for_topic(&self, topic: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Deletes messages older than `retention_days` from one partition.
    /// Returns the number of rows removed; 0 for a missing table.
    async fn purge_expired_messages(
        &self,
        topic: &str,
        partition: u32,
        retention_days: u32,
    ) -> Result<u64>;

    /// Deletes instance rows that are inactive or whose heartbeat is older
    /// than `liveness`. Safe because a live instance heartbeats itself back
    /// into existence.
    async fn reap_instances(&self, liveness: Duration) -> Result<u64>;

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    /// Acquires the named cluster-wide advisory lock, waiting up to
    /// `timeout`. Returns `false` when another session holds it past the
    /// timeout. The lock is tied to a database session and evaporates if
    /// that session dies.
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool>;

    /// Releases a lock acquired by this process. Idempotent.
    async fn release_lock(&self, name: &str) -> Result<()>;

    /// Releases held locks and closes the underlying connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
