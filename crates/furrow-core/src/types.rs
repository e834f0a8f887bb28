//! Rows of the shared schema.
//!
//! These structs mirror the tables every furrow process coordinates through:
//! `topic_metas`, `consumer_instances`, and `consumer_offsets`. They carry no
//! behavior; the store crate reads and writes them, the client crate reasons
//! about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic metadata. One row per topic in `topic_metas`.
///
/// `partition_num` is fixed at creation for all practical purposes: raising
/// it later redistributes the key hash space, so messages produced under the
/// old modulus are no longer found under the new one. The update path exists
/// for administration but is forward-only and lossy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMeta {
    pub topic: String,
    pub partition_num: u32,
    pub retention_days: u32,
}

/// A live (or recently live) subscriber process for one (group, topic).
///
/// The row is written only by the instance it describes, except for reaper
/// deletion. An instance is considered live when `active` is set and
/// `heartbeat` is younger than three heartbeat intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerInstance {
    pub group: String,
    pub topic: String,
    pub instance_id: String,
    pub hostname: String,
    pub active: bool,
    pub heartbeat: DateTime<Utc>,
}

impl ConsumerInstance {
    /// Whether this instance counts as live at `now`, given the liveness
    /// threshold (conventionally three heartbeat intervals).
    pub fn is_live(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.active && self.heartbeat > now - threshold
    }
}

/// Committed offset and current owner for one (group, topic, partition).
///
/// The rebalancer writes `instance_id`; the owning partition worker writes
/// `offset`. The two writers never touch each other's column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOffset {
    pub group: String,
    pub topic: String,
    pub partition: u32,
    /// Last committed offset. `-1` until the first commit.
    pub offset: i64,
    pub instance_id: String,
}

/// One partition-to-instance assignment produced by a rebalance pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub group: String,
    pub topic: String,
    pub partition: u32,
    pub instance_id: String,
}

/// Derived per-partition statistics. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStat {
    pub min_offset: i64,
    pub max_offset: i64,
    pub total: i64,
}

/// Admin paging query over a topic's messages. Not a hot-path type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub topic: String,
    /// Restrict to one partition, or scan all of them.
    pub partition: Option<u32>,
    pub message_id: Option<String>,
    pub tag: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub size: u32,
}

impl MessageQuery {
    pub fn new(topic: impl Into<String>, page: u32, size: u32) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            message_id: None,
            tag: None,
            page: page.max(1),
            size,
        }
    }
}

/// One page of an admin message query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    /// Total matching messages across the queried partitions.
    pub total: i64,
    pub messages: Vec<crate::Message>,
}
