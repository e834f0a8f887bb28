//! The message model.
//!
//! A [`Message`] is both what producers hand to the broker and what consumer
//! handlers receive. Producer-side fields (`topic`, `key`, `tag`, `body`,
//! `delay`) are set through the fluent constructor; storage-side fields
//! (`message_id`, `partition`, `offset`) are filled in by the broker as the
//! message moves through the system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single message in a topic partition.
///
/// ## Example
///
/// ```
/// use furrow_core::Message;
/// use std::time::Duration;
///
/// let msg = Message::new("orders")
///     .key("user-42")
///     .tag("created")
///     .body(b"order payload".to_vec())
///     .delay(Duration::from_secs(30));
/// assert_eq!(msg.topic, "orders");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique id. Assigned by the broker on save when empty.
    pub message_id: String,
    /// Wall-clock creation time.
    pub born_time: DateTime<Utc>,
    /// Destination topic.
    pub topic: String,
    /// Routing key. Only used to pick a partition; empty routes to partition 0.
    pub key: String,
    /// Free-form tag, reserved for filtering.
    pub tag: String,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Partition the message was stored in. Derived from `key` on save.
    pub partition: u32,
    /// Position within the partition. Assigned by storage on save.
    pub offset: i64,
    /// How long to defer delivery. Zero sends immediately.
    pub delay: Duration,
}

impl Message {
    /// Creates a message destined for `topic` with `born_time = now`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            born_time: Utc::now(),
            topic: topic.into(),
            key: String::new(),
            tag: String::new(),
            body: Vec::new(),
            partition: 0,
            offset: 0,
            delay: Duration::ZERO,
        }
    }

    /// Sets the routing key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Sets the payload.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Defers delivery by `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A message parked in the delay queue, waiting for its delivery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayMessage {
    /// Row id in the delay table.
    pub id: i64,
    /// When the message becomes due. Always `>= message.born_time`.
    pub deliver_at: DateTime<Utc>,
    /// The pending message.
    pub message: Message,
}
