//! The broker facade.
//!
//! A [`Broker`] is one furrow node: it owns the store handle, the process
//! identity (a uuid instance id plus the hostname), and every background
//! task the node runs. Producers and subscribers hang off it; `close`
//! shuts the whole node down in bounded time.

use crate::coordinator::{CoordinatorHandle, GroupCoordinator};
use crate::error::{ClientError, Result};
use crate::group_consumer::{GroupConsumer, GroupConsumerHandle};
use crate::producer::Producer;
use crate::promoter::DelayPromoter;
use crate::reaper::Reaper;
use crate::{HandlerError, SharedHandler};
use furrow_core::{
    is_broadcast_group, is_valid_topic_name, Config, ConsumerInstance, ConsumerOffset, Message,
    MessagePage, MessageQuery, PartitionStat, TopicMeta, BROADCAST_GROUP_PREFIX,
};
use furrow_store::{BrokerStore, MySqlBrokerStore, StoreError, TopicDefaults};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// One furrow broker node.
///
/// Cheap to clone; all clones share the same instance identity and
/// background tasks.
///
/// ## Example
///
/// ```ignore
/// let broker = Broker::connect(Config::default().dsn(dsn)).await?;
/// broker
///     .group_subscribe("orders", "billing", |msg| async move {
///         process(msg)?;
///         Ok(())
///     })
///     .await?;
/// broker.send_sync(Message::new("orders").body(payload)).await?;
/// broker.close().await?;
/// ```
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: Config,
    store: Arc<dyn BrokerStore>,
    producer: Producer,
    instance_id: String,
    hostname: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    closed: bool,
    /// One coordinator per "group:topic" subscription key.
    coordinators: HashMap<String, CoordinatorHandle>,
    consumers: Vec<GroupConsumerHandle>,
    background: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Connects to the database, verifies the shared schema, and starts the
    /// per-process background tasks (delay promoter and reaper).
    pub async fn connect(config: Config) -> Result<Broker> {
        let store = MySqlBrokerStore::connect(&config.dsn, TopicDefaults::from(&config)).await?;
        store.ensure_schema().await?;
        Self::with_store(config, Arc::new(store))
    }

    /// Builds a broker over an already-constructed store. This is the
    /// entry point for alternative store backends; `connect` is the common
    /// path.
    pub fn with_store(config: Config, store: Arc<dyn BrokerStore>) -> Result<Broker> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .map_err(|e| ClientError::Config(format!("cannot resolve hostname: {e}")))?;
        let instance_id = Uuid::new_v4().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut background = Vec::new();
        background.push(
            DelayPromoter::new(Arc::clone(&store), config.clone(), shutdown_rx.clone()).spawn(),
        );
        background
            .extend(Reaper::new(Arc::clone(&store), config.clone(), shutdown_rx.clone()).spawn());

        info!(instance_id = %instance_id, hostname = %hostname, "broker started");
        Ok(Broker {
            inner: Arc::new(BrokerInner {
                producer: Producer::new(Arc::clone(&store)),
                config,
                store,
                instance_id,
                hostname,
                shutdown_tx,
                shutdown_rx,
                state: Mutex::new(BrokerState {
                    background,
                    ..BrokerState::default()
                }),
            }),
        })
    }

    /// The uuid identifying this process in `consumer_instances`.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.inner.state.lock().await.closed {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Producing
    // ------------------------------------------------------------------

    /// Sends a message and waits for durability. Messages with a delay are
    /// parked in the delay queue and surface after `deliver_at`.
    pub async fn send_sync(&self, msg: Message) -> Result<String> {
        self.ensure_open().await?;
        self.inner.producer.send_sync(msg).await
    }

    /// Sends on a background task; `callback` receives the outcome exactly
    /// once. The call itself only fails if the broker is closed.
    pub async fn send_async(
        &self,
        msg: Message,
        callback: impl FnOnce(Result<String>) + Send + 'static,
    ) -> Result<()> {
        self.ensure_open().await?;
        self.inner.producer.send_async(msg, callback);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscribing
    // ------------------------------------------------------------------

    /// Subscribes `handler` as part of consumer group `group`.
    ///
    /// Each partition of the topic is consumed by exactly one live group
    /// member at a time, in offset order, with committed offsets, handler
    /// retries, and dead-lettering. Delivery is at-least-once.
    pub async fn group_subscribe<F, Fut>(&self, topic: &str, group: &str, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        if is_broadcast_group(group) {
            return Err(ClientError::Config(format!(
                "group names starting with {BROADCAST_GROUP_PREFIX:?} are reserved, \
                 use broadcast_subscribe"
            )));
        }
        self.subscribe(topic, group, share(handler)).await
    }

    /// Subscribes `handler` as a broadcast consumer: it receives every
    /// message produced after the subscription, with no persistent offset.
    /// Each call gets its own synthetic group and its own copy of the
    /// stream.
    pub async fn broadcast_subscribe<F, Fut>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let group = format!("{BROADCAST_GROUP_PREFIX}{}", Uuid::new_v4());
        self.subscribe(topic, &group, share(handler)).await
    }

    async fn subscribe(&self, topic: &str, group: &str, handler: SharedHandler) -> Result<()> {
        if !is_valid_topic_name(topic) {
            return Err(StoreError::InvalidTopic(topic.to_string()).into());
        }
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ClientError::Closed);
        }
        let key = format!("{group}:{topic}");
        if !state.coordinators.contains_key(&key) {
            let coordinator = GroupCoordinator::new(
                Arc::clone(&self.inner.store),
                self.inner.config.clone(),
                group,
                topic,
                self.inner.instance_id.clone(),
                self.inner.hostname.clone(),
                self.inner.shutdown_rx.clone(),
            );
            state.coordinators.insert(key, coordinator.spawn());
        }
        let consumer = GroupConsumer::new(
            Arc::clone(&self.inner.store),
            self.inner.config.clone(),
            group,
            topic,
            self.inner.instance_id.clone(),
            handler,
            self.inner.shutdown_rx.clone(),
        );
        state.consumers.push(consumer.spawn());
        info!(topic, group, "subscription registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// All known topics.
    pub async fn topics(&self) -> Result<Vec<TopicMeta>> {
        Ok(self.inner.store.list_topics().await?)
    }

    /// Creates a topic with explicit settings instead of the defaults.
    pub async fn create_topic(&self, meta: &TopicMeta) -> Result<()> {
        Ok(self.inner.store.create_topic(meta).await?)
    }

    /// Updates a topic's partition count and retention. Raising the
    /// partition count redistributes the key hash space and is lossy for
    /// keyed reads; see the data-model notes before using it.
    pub async fn update_topic(&self, meta: &TopicMeta) -> Result<()> {
        Ok(self.inner.store.update_topic(meta).await?)
    }

    /// Deletes a topic and all of its data. Refused while the topic has
    /// live consumers.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        Ok(self
            .inner
            .store
            .delete_topic(topic, self.inner.config.liveness_threshold())
            .await?)
    }

    /// Min/max offset and message count for one partition.
    pub async fn partition_stat(&self, topic: &str, partition: u32) -> Result<PartitionStat> {
        Ok(self.inner.store.partition_stat(topic, partition).await?)
    }

    /// Admin paging query over a topic's messages.
    pub async fn query_messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        Ok(self.inner.store.query_messages(query).await?)
    }

    /// Consumer instances known for a topic, optionally one group.
    pub async fn consumer_instances(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Vec<ConsumerInstance>> {
        Ok(self.inner.store.list_instances(topic, group).await?)
    }

    /// Offset rows for a topic, optionally one group.
    pub async fn consumer_offsets(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Vec<ConsumerOffset>> {
        Ok(self.inner.store.list_offsets(topic, group).await?)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Gracefully stops this node: signals every loop, waits for workers to
    /// wind down, marks this instance inactive for each subscription, and
    /// closes the store. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (coordinators, consumers, background) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (
                std::mem::take(&mut state.coordinators),
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.background),
            )
        };
        info!(instance_id = %self.inner.instance_id, "broker shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        for consumer in consumers {
            consumer.join().await;
        }
        for (_, coordinator) in coordinators {
            let group = coordinator.group.clone();
            let topic = coordinator.topic.clone();
            coordinator.join().await;
            if let Err(e) = self
                .inner
                .store
                .mark_instance_inactive(&group, &topic, &self.inner.instance_id)
                .await
            {
                tracing::warn!(group, topic, error = %e, "failed to mark instance inactive");
            }
        }
        for task in background {
            let _ = task.await;
        }
        self.inner.store.close().await?;
        info!(instance_id = %self.inner.instance_id, "broker stopped");
        Ok(())
    }
}

/// Boxes a user handler into the shared, type-erased form workers store.
fn share<F, Fut>(handler: F) -> SharedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(
        move |msg: Message| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            Box::pin(handler(msg))
        },
    )
}
