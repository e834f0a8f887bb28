//! Test support: an in-memory [`BrokerStore`] and canned handlers.
//!
//! The memory store implements the full store trait over plain maps so the
//! coordination engine can be exercised quickly and deterministically.
//! Advisory locks are process-wide here instead of cluster-wide, which is
//! exactly what a single-process test needs.

use crate::{HandlerError, SharedHandler};
use async_trait::async_trait;
use chrono::Utc;
use furrow_core::{
    dead_letter_topic, is_valid_topic_name, partition_for_key, ConsumerInstance, ConsumerOffset,
    DelayMessage, Message, MessagePage, MessageQuery, PartitionAssignment, PartitionStat,
    TopicMeta,
};
use furrow_store::{BrokerStore, Result, StoreError};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MemLog {
    next_offset: i64,
    messages: Vec<Message>,
}

struct OffsetRow {
    offset: i64,
    instance_id: String,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicMeta>,
    logs: HashMap<(String, u32), MemLog>,
    delay: Vec<DelayMessage>,
    next_delay_id: i64,
    instances: HashMap<(String, String, String), ConsumerInstance>,
    offsets: HashMap<(String, String, u32), OffsetRow>,
    locks: HashSet<String>,
}

/// In-memory [`BrokerStore`] for unit tests.
pub(crate) struct MemoryBrokerStore {
    partition_num: u32,
    retention_days: u32,
    fail_saves: AtomicBool,
    state: Mutex<State>,
}

impl MemoryBrokerStore {
    pub(crate) fn new(partition_num: u32, retention_days: u32) -> Self {
        Self {
            partition_num,
            retention_days,
            fail_saves: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// Makes every subsequent `save_message` fail until reset.
    pub(crate) fn fail_message_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn delay_queue_len(&self) -> usize {
        self.state.lock().unwrap().delay.len()
    }

    pub(crate) async fn make_all_delay_messages_due(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        for delayed in &mut self.state.lock().unwrap().delay {
            delayed.deliver_at = past;
        }
    }

    /// Backdates one stored message's born time by `by`.
    pub(crate) async fn age_message(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        by: chrono::Duration,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.logs.get_mut(&(topic.to_string(), partition)) {
            for msg in &mut log.messages {
                if msg.offset == offset {
                    msg.born_time = msg.born_time - by;
                }
            }
        }
    }

    /// Backdates an instance's heartbeat by `by`.
    pub(crate) async fn age_heartbeat(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
        by: chrono::Duration,
    ) {
        let key = (group.to_string(), topic.to_string(), instance_id.to_string());
        if let Some(instance) = self.state.lock().unwrap().instances.get_mut(&key) {
            instance.heartbeat = instance.heartbeat - by;
        }
    }

    fn injected_failure() -> StoreError {
        StoreError::Database(sqlx::Error::Protocol("injected save failure".into()))
    }
}

#[async_trait]
impl BrokerStore for MemoryBrokerStore {
    async fn get_or_create_topic(&self, topic: &str) -> Result<TopicMeta> {
        if !is_valid_topic_name(topic) {
            return Err(StoreError::InvalidTopic(topic.to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let meta = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicMeta {
                topic: topic.to_string(),
                partition_num: self.partition_num,
                retention_days: self.retention_days,
            });
        Ok(meta.clone())
    }

    async fn get_topic(&self, topic: &str) -> Result<Option<TopicMeta>> {
        Ok(self.state.lock().unwrap().topics.get(topic).cloned())
    }

    async fn list_topics(&self) -> Result<Vec<TopicMeta>> {
        let mut topics: Vec<TopicMeta> =
            self.state.lock().unwrap().topics.values().cloned().collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(topics)
    }

    async fn create_topic(&self, meta: &TopicMeta) -> Result<()> {
        if !is_valid_topic_name(&meta.topic) {
            return Err(StoreError::InvalidTopic(meta.topic.clone()));
        }
        let mut state = self.state.lock().unwrap();
        if state.topics.contains_key(&meta.topic) {
            return Err(StoreError::TopicExists(meta.topic.clone()));
        }
        state.topics.insert(meta.topic.clone(), meta.clone());
        Ok(())
    }

    async fn update_topic(&self, meta: &TopicMeta) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.topics.get_mut(&meta.topic) {
            Some(existing) => {
                *existing = meta.clone();
                Ok(())
            }
            None => Err(StoreError::TopicNotFound(meta.topic.clone())),
        }
    }

    async fn delete_topic(&self, topic: &str, liveness: Duration) -> Result<()> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(liveness).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock().unwrap();
        let live = state
            .instances
            .values()
            .any(|i| i.topic == topic && i.is_live(now, threshold));
        if live {
            return Err(StoreError::TopicInUse(topic.to_string()));
        }
        if state.topics.remove(topic).is_none() {
            return Err(StoreError::TopicNotFound(topic.to_string()));
        }
        state.logs.retain(|(t, _), _| t != topic);
        state.offsets.retain(|(_, t, _), _| t != topic);
        Ok(())
    }

    async fn save_message(&self, mut msg: Message) -> Result<String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::injected_failure());
        }
        let meta = self.get_or_create_topic(&msg.topic).await?;
        msg.partition = partition_for_key(&msg.key, meta.partition_num);
        if msg.message_id.is_empty() {
            msg.message_id = Uuid::new_v4().to_string();
        }
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .entry((msg.topic.clone(), msg.partition))
            .or_default();
        if log.messages.iter().any(|m| m.message_id == msg.message_id) {
            return Err(StoreError::DuplicateMessage(msg.message_id));
        }
        log.next_offset += 1;
        msg.offset = log.next_offset;
        let id = msg.message_id.clone();
        log.messages.push(msg);
        Ok(id)
    }

    async fn save_dead_letter(&self, msg: &Message) -> Result<String> {
        let dead = dead_letter_topic(&msg.topic);
        self.get_or_create_topic(&dead).await?;
        let mut state = self.state.lock().unwrap();
        let log = state.logs.entry((dead.clone(), msg.partition)).or_default();
        if log.messages.iter().any(|m| m.message_id == msg.message_id) {
            return Ok(msg.message_id.clone());
        }
        let mut copy = msg.clone();
        copy.topic = dead;
        log.next_offset += 1;
        copy.offset = log.next_offset;
        let id = copy.message_id.clone();
        log.messages.push(copy);
        Ok(id)
    }

    async fn fetch_messages(
        &self,
        topic: &str,
        partition: u32,
        after_offset: i64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let state = self.state.lock().unwrap();
        let Some(log) = state.logs.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };
        Ok(log
            .messages
            .iter()
            .filter(|m| m.offset > after_offset)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn partition_stat(&self, topic: &str, partition: u32) -> Result<PartitionStat> {
        let state = self.state.lock().unwrap();
        let Some(log) = state.logs.get(&(topic.to_string(), partition)) else {
            return Ok(PartitionStat::default());
        };
        Ok(PartitionStat {
            min_offset: log.messages.first().map_or(0, |m| m.offset),
            max_offset: log.messages.last().map_or(0, |m| m.offset),
            total: log.messages.len() as i64,
        })
    }

    async fn drop_partition(&self, topic: &str, partition: u32) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .logs
            .remove(&(topic.to_string(), partition));
        Ok(())
    }

    async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        let meta = self
            .get_topic(&query.topic)
            .await?
            .ok_or_else(|| StoreError::TopicNotFound(query.topic.clone()))?;
        let partitions: Vec<u32> = match query.partition {
            Some(p) => vec![p],
            None => (0..meta.partition_num).collect(),
        };
        let state = self.state.lock().unwrap();
        let mut matched: Vec<Message> = Vec::new();
        for partition in partitions {
            if let Some(log) = state.logs.get(&(query.topic.clone(), partition)) {
                matched.extend(
                    log.messages
                        .iter()
                        .filter(|m| {
                            query
                                .message_id
                                .as_ref()
                                .map_or(true, |id| &m.message_id == id)
                                && query.tag.as_ref().map_or(true, |tag| &m.tag == tag)
                        })
                        .cloned(),
                );
            }
        }
        matched.sort_by(|a, b| b.born_time.cmp(&a.born_time).then(b.offset.cmp(&a.offset)));
        let total = matched.len() as i64;
        let start = ((query.page.max(1) - 1) * query.size) as usize;
        let messages = matched
            .into_iter()
            .skip(start)
            .take(query.size as usize)
            .collect();
        Ok(MessagePage { total, messages })
    }

    async fn add_delay_message(&self, mut msg: Message) -> Result<String> {
        if !is_valid_topic_name(&msg.topic) {
            return Err(StoreError::InvalidTopic(msg.topic));
        }
        if msg.message_id.is_empty() {
            msg.message_id = Uuid::new_v4().to_string();
        }
        let deliver_at =
            msg.born_time + chrono::Duration::from_std(msg.delay).unwrap_or_else(|_| chrono::Duration::zero());
        let id = msg.message_id.clone();
        let mut state = self.state.lock().unwrap();
        state.next_delay_id += 1;
        let row_id = state.next_delay_id;
        state.delay.push(DelayMessage {
            id: row_id,
            deliver_at,
            message: msg,
        });
        Ok(id)
    }

    async fn fetch_due_delay_messages(&self, limit: u32) -> Result<Vec<DelayMessage>> {
        let now = Utc::now();
        let state = self.state.lock().unwrap();
        let mut due: Vec<DelayMessage> = state
            .delay
            .iter()
            .filter(|d| d.deliver_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.deliver_at.cmp(&b.deliver_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn delete_delay_message(&self, id: i64) -> Result<()> {
        self.state.lock().unwrap().delay.retain(|d| d.id != id);
        Ok(())
    }

    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
        hostname: &str,
    ) -> Result<()> {
        let key = (group.to_string(), topic.to_string(), instance_id.to_string());
        let mut state = self.state.lock().unwrap();
        state
            .instances
            .entry(key)
            .and_modify(|i| {
                i.heartbeat = Utc::now();
                i.active = true;
                i.hostname = hostname.to_string();
            })
            .or_insert_with(|| ConsumerInstance {
                group: group.to_string(),
                topic: topic.to_string(),
                instance_id: instance_id.to_string(),
                hostname: hostname.to_string(),
                active: true,
                heartbeat: Utc::now(),
            });
        Ok(())
    }

    async fn mark_instance_inactive(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<()> {
        let key = (group.to_string(), topic.to_string(), instance_id.to_string());
        if let Some(instance) = self.state.lock().unwrap().instances.get_mut(&key) {
            instance.active = false;
        }
        Ok(())
    }

    async fn list_active_instances(
        &self,
        group: &str,
        topic: &str,
        liveness: Duration,
    ) -> Result<Vec<ConsumerInstance>> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(liveness).unwrap_or_else(|_| chrono::Duration::zero());
        let mut instances: Vec<ConsumerInstance> = self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.group == group && i.topic == topic && i.is_live(now, threshold))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn list_instances(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Vec<ConsumerInstance>> {
        let mut instances: Vec<ConsumerInstance> = self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| i.topic == topic && group.map_or(true, |g| i.group == g))
            .cloned()
            .collect();
        instances.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.instance_id.cmp(&b.instance_id))
        });
        Ok(instances)
    }

    async fn apply_assignments(&self, assignments: &[PartitionAssignment]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for a in assignments {
            state
                .offsets
                .entry((a.group.clone(), a.topic.clone(), a.partition))
                .and_modify(|row| row.instance_id = a.instance_id.clone())
                .or_insert_with(|| OffsetRow {
                    offset: -1,
                    instance_id: a.instance_id.clone(),
                });
        }
        Ok(())
    }

    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
    ) -> Result<Option<i64>> {
        let key = (group.to_string(), topic.to_string(), partition);
        Ok(self
            .state
            .lock()
            .unwrap()
            .offsets
            .get(&key)
            .filter(|row| row.instance_id == instance_id)
            .map(|row| row.offset))
    }

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
        offset: i64,
    ) -> Result<()> {
        let key = (group.to_string(), topic.to_string(), partition);
        match self.state.lock().unwrap().offsets.get_mut(&key) {
            Some(row) if row.instance_id == instance_id => {
                row.offset = offset;
                Ok(())
            }
            _ => Err(StoreError::LostOwnership),
        }
    }

    async fn partitions_for_instance(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<Vec<u32>> {
        let mut partitions: Vec<u32> = self
            .state
            .lock()
            .unwrap()
            .offsets
            .iter()
            .filter(|((g, t, _), row)| g == group && t == topic && row.instance_id == instance_id)
            .map(|((_, _, partition), _)| *partition)
            .collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn list_offsets(&self, topic: &str, group: Option<&str>) -> Result<Vec<ConsumerOffset>> {
        let mut offsets: Vec<ConsumerOffset> = self
            .state
            .lock()
            .unwrap()
            .offsets
            .iter()
            .filter(|((g, t, _), _)| t == topic && group.map_or(true, |wanted| g == wanted))
            .map(|((g, t, partition), row)| ConsumerOffset {
                group: g.clone(),
                topic: t.clone(),
                partition: *partition,
                offset: row.offset,
                instance_id: row.instance_id.clone(),
            })
            .collect();
        offsets.sort_by(|a, b| a.group.cmp(&b.group).then(a.partition.cmp(&b.partition)));
        Ok(offsets)
    }

    async fn delete_offsets_for_topic(&self, topic: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .offsets
            .retain(|(_, t, _), _| t != topic);
        Ok(())
    }

    async fn purge_expired_messages(
        &self,
        topic: &str,
        partition: u32,
        retention_days: u32,
    ) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let mut state = self.state.lock().unwrap();
        let Some(log) = state.logs.get_mut(&(topic.to_string(), partition)) else {
            return Ok(0);
        };
        let before = log.messages.len();
        log.messages.retain(|m| m.born_time >= cutoff);
        Ok((before - log.messages.len()) as u64)
    }

    async fn reap_instances(&self, liveness: Duration) -> Result<u64> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(liveness).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock().unwrap();
        let before = state.instances.len();
        state
            .instances
            .retain(|_, i| i.active && i.heartbeat >= now - threshold);
        Ok((before - state.instances.len()) as u64)
    }

    async fn acquire_lock(&self, name: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.state.lock().unwrap().locks.insert(name.to_string()))
    }

    async fn release_lock(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().locks.remove(name);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Canned handlers
// ----------------------------------------------------------------------

/// Handler that records every message it sees.
pub(crate) fn recording_handler() -> (SharedHandler, Arc<Mutex<Vec<Message>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: SharedHandler = Arc::new(
        move |msg: Message| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(msg);
                Ok(())
            })
        },
    );
    (handler, seen)
}

/// Handler that counts invocations and always succeeds.
pub(crate) fn counting_handler() -> (SharedHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler: SharedHandler = Arc::new(
        move |_msg: Message| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        },
    );
    (handler, calls)
}

/// Handler that counts invocations and always fails.
pub(crate) fn failing_handler() -> (SharedHandler, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler: SharedHandler = Arc::new(
        move |_msg: Message| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("handler rejected message".into())
            })
        },
    );
    (handler, calls)
}
