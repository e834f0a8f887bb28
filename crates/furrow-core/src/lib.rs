//! Core types for the furrow message broker.
//!
//! Furrow is a partitioned, pull-based message broker that uses a shared
//! MySQL-compatible database for all persistence and coordination. This crate
//! holds the pieces every other furrow crate agrees on:
//!
//! - [`Message`]: the unit of delivery, with a fluent constructor
//! - [`TopicMeta`], [`ConsumerInstance`], [`ConsumerOffset`],
//!   [`PartitionStat`]: the rows of the shared schema
//! - [`Config`]: all tunables, with production defaults
//! - [`partition_for_key`]: the key-to-partition hash that is part of the
//!   wire contract
//! - Reserved names: the `__broadcast__` group prefix, the `_dead` topic
//!   suffix, and the cluster advisory lock names

pub mod config;
pub mod message;
pub mod partition;
pub mod types;

pub use config::Config;
pub use message::{DelayMessage, Message};
pub use partition::{is_valid_topic_name, key_hash, partition_for_key, MAX_TOPIC_LEN};
pub use types::{
    ConsumerInstance, ConsumerOffset, MessagePage, MessageQuery, PartitionAssignment,
    PartitionStat, TopicMeta,
};

/// Consumer groups starting with this prefix are broadcast subscriptions:
/// every instance sees every message and no offsets are persisted.
pub const BROADCAST_GROUP_PREFIX: &str = "__broadcast__";

/// Suffix of the sibling topic where messages land after exhausting handler
/// retries.
pub const DEAD_LETTER_SUFFIX: &str = "_dead";

/// Cluster advisory lock electing the single rebalancer.
pub const REBALANCE_LOCK: &str = "rebalance_lock";

/// Cluster advisory lock electing the single delay-message promoter.
pub const DELAY_MESSAGE_LOCK: &str = "delay_message_lock";

/// Returns the dead-letter topic for `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DEAD_LETTER_SUFFIX}")
}

/// Whether `group` names a broadcast subscription.
pub fn is_broadcast_group(group: &str) -> bool {
    group.starts_with(BROADCAST_GROUP_PREFIX)
}
