//! MySQL implementation of [`BrokerStore`].
//!
//! ## Runtime queries
//!
//! Every per-partition log lives in its own table named
//! `messages_<topic>_<partition>`, so table names are computed at runtime
//! and queries go through `sqlx::query` / `sqlx::query_as` rather than the
//! compile-time macros. Topic names are validated against `[A-Za-z0-9_-]`
//! before ever being interpolated into SQL.
//!
//! ## Lazy table creation
//!
//! Partition tables are created on the first insert that fails with
//! SQLSTATE `42S02` (table missing), then the insert is retried once. Read
//! paths treat a missing table as an empty partition.
//!
//! ## Advisory locks
//!
//! `GET_LOCK` is session-scoped, and pooled connections outlive any single
//! call, so each held lock pins a connection detached from the pool. The
//! connection is closed when the lock is released, and if the process dies
//! the server drops the session and the lock with it.
//!
//! ## Clocks
//!
//! All server-side time arithmetic uses `UTC_TIMESTAMP(3)` so that
//! heartbeat liveness and retention comparisons are immune to the server's
//! session time zone; client-side timestamps are `chrono::DateTime<Utc>`
//! stored in `DATETIME(3)` columns.

use crate::error::{Result, StoreError};
use crate::BrokerStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use furrow_core::{
    dead_letter_topic, is_valid_topic_name, partition_for_key, Config, ConsumerInstance,
    ConsumerOffset, DelayMessage, Message, MessagePage, MessageQuery, PartitionAssignment,
    PartitionStat, TopicMeta,
};
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const CREATE_TOPIC_METAS: &str = r#"
CREATE TABLE IF NOT EXISTS topic_metas (
    `topic` VARCHAR(256) NOT NULL,
    `partition_num` INT UNSIGNED NOT NULL,
    `retention_days` INT UNSIGNED NOT NULL,
    PRIMARY KEY (`topic`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const CREATE_DELAY_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS delay_messages (
    `id` BIGINT NOT NULL AUTO_INCREMENT,
    `message_id` VARCHAR(64) NOT NULL,
    `topic` VARCHAR(256) NOT NULL,
    `key` VARCHAR(256) NOT NULL DEFAULT '',
    `tag` VARCHAR(256) NOT NULL DEFAULT '',
    `body` MEDIUMBLOB,
    `born_time` DATETIME(3) NOT NULL,
    `deliver_at` DATETIME(3) NOT NULL,
    PRIMARY KEY (`id`),
    KEY `idx_deliver_at` (`deliver_at`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const CREATE_CONSUMER_INSTANCES: &str = r#"
CREATE TABLE IF NOT EXISTS consumer_instances (
    `group` VARCHAR(256) NOT NULL,
    `topic` VARCHAR(256) NOT NULL,
    `instance_id` VARCHAR(64) NOT NULL,
    `hostname` VARCHAR(256) NOT NULL DEFAULT '',
    `active` BOOLEAN NOT NULL DEFAULT TRUE,
    `heartbeat` DATETIME(3) NOT NULL,
    PRIMARY KEY (`group`, `topic`, `instance_id`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

const CREATE_CONSUMER_OFFSETS: &str = r#"
CREATE TABLE IF NOT EXISTS consumer_offsets (
    `group` VARCHAR(256) NOT NULL,
    `topic` VARCHAR(256) NOT NULL,
    `partition` INT UNSIGNED NOT NULL,
    `offset` BIGINT NOT NULL DEFAULT -1,
    `instance_id` VARCHAR(64) NOT NULL,
    PRIMARY KEY (`group`, `topic`, `partition`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#;

/// Defaults applied when a topic is auto-created on first produce.
#[derive(Debug, Clone, Copy)]
pub struct TopicDefaults {
    pub partition_num: u32,
    pub retention_days: u32,
}

impl From<&Config> for TopicDefaults {
    fn from(cfg: &Config) -> Self {
        Self {
            partition_num: cfg.default_partition_num,
            retention_days: cfg.retention_days,
        }
    }
}

/// [`BrokerStore`] backed by a MySQL-compatible database.
pub struct MySqlBrokerStore {
    pool: MySqlPool,
    defaults: TopicDefaults,
    /// One pinned session per held advisory lock.
    locks: Mutex<HashMap<String, MySqlConnection>>,
}

impl MySqlBrokerStore {
    /// Connects a pool to `dsn` and verifies the connection.
    pub async fn connect(dsn: &str, defaults: TopicDefaults) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await?;
        Ok(Self::new(pool, defaults))
    }

    /// Wraps an existing pool.
    pub fn new(pool: MySqlPool, defaults: TopicDefaults) -> Self {
        Self {
            pool,
            defaults,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the shared tables if they do not exist. Partition message
    /// tables are not created here; they appear lazily on first insert.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in [
            CREATE_TOPIC_METAS,
            CREATE_DELAY_MESSAGES,
            CREATE_CONSUMER_INSTANCES,
            CREATE_CONSUMER_OFFSETS,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        debug!("shared broker tables verified");
        Ok(())
    }

    fn message_table(topic: &str, partition: u32) -> Result<String> {
        if !is_valid_topic_name(topic) {
            return Err(StoreError::InvalidTopic(topic.to_string()));
        }
        Ok(format!("messages_{topic}_{partition}"))
    }

    async fn create_message_table(&self, table: &str) -> Result<()> {
        info!(table, "creating partition message table");
        let ddl = format!(
            r#"
CREATE TABLE IF NOT EXISTS `{table}` (
    `offset` BIGINT NOT NULL AUTO_INCREMENT,
    `message_id` VARCHAR(64) NOT NULL,
    `tag` VARCHAR(256) NOT NULL DEFAULT '',
    `key` VARCHAR(256) NOT NULL DEFAULT '',
    `body` MEDIUMBLOB,
    `born_time` DATETIME(3) NOT NULL,
    PRIMARY KEY (`offset`),
    UNIQUE KEY `uk_message_id` (`message_id`),
    KEY `idx_born_time` (`born_time`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
"#
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_message(&self, table: &str, msg: &Message) -> sqlx::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO `{table}` (`message_id`, `tag`, `key`, `body`, `born_time`) \
             VALUES (?, ?, ?, ?, ?)"
        ))
        .bind(&msg.message_id)
        .bind(&msg.tag)
        .bind(&msg.key)
        .bind(&msg.body)
        .bind(msg.born_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert with the lazy create-and-retry-once recovery.
    async fn insert_with_table_recovery(&self, table: &str, msg: &Message) -> Result<()> {
        match self.insert_message(table, msg).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_table(&e) => {
                self.create_message_table(table).await?;
                self.insert_message(table, msg)
                    .await
                    .map_err(|e| map_insert_error(e, &msg.message_id))
            }
            Err(e) => Err(map_insert_error(e, &msg.message_id)),
        }
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.code().as_deref() == Some("42S02"))
}

fn is_duplicate_key(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.code().as_deref() == Some("23000"))
}

fn map_insert_error(err: sqlx::Error, message_id: &str) -> StoreError {
    if is_duplicate_key(&err) {
        StoreError::DuplicateMessage(message_id.to_string())
    } else {
        StoreError::Database(err)
    }
}

type MessageRow = (String, String, String, Vec<u8>, DateTime<Utc>, i64);

fn row_to_message(topic: &str, partition: u32, row: MessageRow) -> Message {
    let (message_id, tag, key, body, born_time, offset) = row;
    Message {
        message_id,
        born_time,
        topic: topic.to_string(),
        key,
        tag,
        body,
        partition,
        offset,
        delay: Duration::ZERO,
    }
}

#[async_trait]
impl BrokerStore for MySqlBrokerStore {
    // ------------------------------------------------------------------
    // Topic registry
    // ------------------------------------------------------------------

    async fn get_or_create_topic(&self, topic: &str) -> Result<TopicMeta> {
        if !is_valid_topic_name(topic) {
            return Err(StoreError::InvalidTopic(topic.to_string()));
        }
        if let Some(meta) = self.get_topic(topic).await? {
            return Ok(meta);
        }
        let meta = TopicMeta {
            topic: topic.to_string(),
            partition_num: self.defaults.partition_num,
            retention_days: self.defaults.retention_days,
        };
        match self.create_topic(&meta).await {
            Ok(()) => {
                info!(
                    topic,
                    partitions = meta.partition_num,
                    "auto-created topic"
                );
                Ok(meta)
            }
            // Lost the race to a concurrent producer; its row is the truth.
            Err(StoreError::TopicExists(_)) => self
                .get_topic(topic)
                .await?
                .ok_or_else(|| StoreError::TopicNotFound(topic.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn get_topic(&self, topic: &str) -> Result<Option<TopicMeta>> {
        let row: Option<(String, u32, u32)> = sqlx::query_as(
            "SELECT `topic`, `partition_num`, `retention_days` FROM topic_metas WHERE `topic` = ?",
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(topic, partition_num, retention_days)| TopicMeta {
            topic,
            partition_num,
            retention_days,
        }))
    }

    async fn list_topics(&self) -> Result<Vec<TopicMeta>> {
        let rows: Vec<(String, u32, u32)> = sqlx::query_as(
            "SELECT `topic`, `partition_num`, `retention_days` FROM topic_metas ORDER BY `topic`",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(topic, partition_num, retention_days)| TopicMeta {
                topic,
                partition_num,
                retention_days,
            })
            .collect())
    }

    async fn create_topic(&self, meta: &TopicMeta) -> Result<()> {
        if !is_valid_topic_name(&meta.topic) {
            return Err(StoreError::InvalidTopic(meta.topic.clone()));
        }
        let result = sqlx::query(
            "INSERT INTO topic_metas (`topic`, `partition_num`, `retention_days`) VALUES (?, ?, ?)",
        )
        .bind(&meta.topic)
        .bind(meta.partition_num)
        .bind(meta.retention_days)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::TopicExists(meta.topic.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_topic(&self, meta: &TopicMeta) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE topic_metas SET `partition_num` = ?, `retention_days` = ? WHERE `topic` = ?",
        )
        .bind(meta.partition_num)
        .bind(meta.retention_days)
        .bind(&meta.topic)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::TopicNotFound(meta.topic.clone()));
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str, liveness: Duration) -> Result<()> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(liveness).unwrap_or(chrono::Duration::zero());
        let instances = self.list_instances(topic, None).await?;
        if instances.iter().any(|i| i.is_live(now, threshold)) {
            return Err(StoreError::TopicInUse(topic.to_string()));
        }
        let meta = self
            .get_topic(topic)
            .await?
            .ok_or_else(|| StoreError::TopicNotFound(topic.to_string()))?;

        // Data first, metadata last: a crash mid-way leaves orphans that a
        // retried delete cleans up.
        for partition in 0..meta.partition_num {
            self.drop_partition(topic, partition).await?;
        }
        self.delete_offsets_for_topic(topic).await?;
        sqlx::query("DELETE FROM topic_metas WHERE `topic` = ?")
            .bind(topic)
            .execute(&self.pool)
            .await?;
        info!(topic, "deleted topic");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message log
    // ------------------------------------------------------------------

    async fn save_message(&self, mut msg: Message) -> Result<String> {
        let meta = self.get_or_create_topic(&msg.topic).await?;
        msg.partition = partition_for_key(&msg.key, meta.partition_num);
        if msg.message_id.is_empty() {
            msg.message_id = Uuid::new_v4().to_string();
        }
        let table = Self::message_table(&msg.topic, msg.partition)?;
        self.insert_with_table_recovery(&table, &msg).await?;
        debug!(
            topic = %msg.topic,
            partition = msg.partition,
            message_id = %msg.message_id,
            "saved message"
        );
        Ok(msg.message_id)
    }

    async fn save_dead_letter(&self, msg: &Message) -> Result<String> {
        let dead = dead_letter_topic(&msg.topic);
        self.get_or_create_topic(&dead).await?;
        let mut copy = msg.clone();
        copy.topic = dead;
        let table = Self::message_table(&copy.topic, copy.partition)?;
        match self.insert_with_table_recovery(&table, &copy).await {
            Ok(()) => Ok(copy.message_id),
            // Already parked by a previous attempt.
            Err(StoreError::DuplicateMessage(id)) => Ok(id),
            Err(e) => Err(e),
        }
    }

    async fn fetch_messages(
        &self,
        topic: &str,
        partition: u32,
        after_offset: i64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let table = Self::message_table(topic, partition)?;
        let rows: Vec<MessageRow> = match sqlx::query_as(&format!(
            "SELECT `message_id`, `tag`, `key`, `body`, `born_time`, `offset` \
             FROM `{table}` WHERE `offset` > ? ORDER BY `offset` LIMIT ?"
        ))
        .bind(after_offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) if is_missing_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(rows
            .into_iter()
            .map(|row| row_to_message(topic, partition, row))
            .collect())
    }

    async fn partition_stat(&self, topic: &str, partition: u32) -> Result<PartitionStat> {
        let table = Self::message_table(topic, partition)?;
        let row: (i64, i64, i64) = match sqlx::query_as(&format!(
            "SELECT COALESCE(MIN(`offset`), 0), COALESCE(MAX(`offset`), 0), COUNT(*) \
             FROM `{table}`"
        ))
        .fetch_one(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(e) if is_missing_table(&e) => return Ok(PartitionStat::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(PartitionStat {
            min_offset: row.0,
            max_offset: row.1,
            total: row.2,
        })
    }

    async fn drop_partition(&self, topic: &str, partition: u32) -> Result<()> {
        let table = Self::message_table(topic, partition)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS `{table}`"))
            .execute(&self.pool)
            .await?;
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

        // Fixed base plus optional predicates; no templating engine.
        let mut predicate = String::from("WHERE 1 = 1");
        let mut binds: Vec<&str> = Vec::new();
        if let Some(id) = &query.message_id {
            predicate.push_str(" AND `message_id` = ?");
            binds.push(id.as_str());
        }
        if let Some(tag) = &query.tag {
            predicate.push_str(" AND `tag` = ?");
            binds.push(tag.as_str());
        }

        let page = query.page.max(1);
        let window = i64::from(page) * i64::from(query.size);
        let mut total = 0i64;
        let mut merged: Vec<Message> = Vec::new();
        for partition in partitions {
            let table = Self::message_table(&query.topic, partition)?;

            let count_sql = format!("SELECT COUNT(*) FROM `{table}` {predicate}");
            let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
            for bind in &binds {
                count_query = count_query.bind(*bind);
            }
            let count = match count_query.fetch_one(&self.pool).await {
                Ok((count,)) => count,
                Err(e) if is_missing_table(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            total += count;

            let rows_sql = format!(
                "SELECT `message_id`, `tag`, `key`, `body`, `born_time`, `offset` \
                 FROM `{table}` {predicate} ORDER BY `offset` DESC LIMIT ?"
            );
            let mut rows_query = sqlx::query_as::<_, MessageRow>(&rows_sql);
            for bind in &binds {
                rows_query = rows_query.bind(*bind);
            }
            let rows = rows_query.bind(window).fetch_all(&self.pool).await?;
            merged.extend(
                rows.into_iter()
                    .map(|row| row_to_message(&query.topic, partition, row)),
            );
        }

        // Page across the merged partitions, newest first.
        merged.sort_by(|a, b| {
            b.born_time
                .cmp(&a.born_time)
                .then(b.offset.cmp(&a.offset))
        });
        let start = (i64::from(page) - 1) * i64::from(query.size);
        let messages = merged
            .into_iter()
            .skip(start.max(0) as usize)
            .take(query.size as usize)
            .collect();
        Ok(MessagePage { total, messages })
    }

    // ------------------------------------------------------------------
    // Delay queue
    // ------------------------------------------------------------------

    async fn add_delay_message(&self, mut msg: Message) -> Result<String> {
        if !is_valid_topic_name(&msg.topic) {
            return Err(StoreError::InvalidTopic(msg.topic));
        }
        if msg.message_id.is_empty() {
            msg.message_id = Uuid::new_v4().to_string();
        }
        let deliver_at = msg.born_time
            + chrono::Duration::from_std(msg.delay).unwrap_or(chrono::Duration::zero());
        sqlx::query(
            "INSERT INTO delay_messages \
             (`message_id`, `topic`, `key`, `tag`, `body`, `born_time`, `deliver_at`) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.message_id)
        .bind(&msg.topic)
        .bind(&msg.key)
        .bind(&msg.tag)
        .bind(&msg.body)
        .bind(msg.born_time)
        .bind(deliver_at)
        .execute(&self.pool)
        .await?;
        debug!(topic = %msg.topic, message_id = %msg.message_id, %deliver_at, "parked delay message");
        Ok(msg.message_id)
    }

    async fn fetch_due_delay_messages(&self, limit: u32) -> Result<Vec<DelayMessage>> {
        type DelayRow = (
            i64,
            String,
            String,
            String,
            String,
            Vec<u8>,
            DateTime<Utc>,
            DateTime<Utc>,
        );
        let rows: Vec<DelayRow> = sqlx::query_as(
            "SELECT `id`, `message_id`, `topic`, `key`, `tag`, `body`, `born_time`, `deliver_at` \
             FROM delay_messages WHERE `deliver_at` <= UTC_TIMESTAMP(3) \
             ORDER BY `deliver_at` LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, message_id, topic, key, tag, body, born_time, deliver_at)| DelayMessage {
                    id,
                    deliver_at,
                    message: Message {
                        message_id,
                        born_time,
                        topic,
                        key,
                        tag,
                        body,
                        partition: 0,
                        offset: 0,
                        delay: Duration::ZERO,
                    },
                },
            )
            .collect())
    }

    async fn delete_delay_message(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM delay_messages WHERE `id` = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group membership
    // ------------------------------------------------------------------

    async fn heartbeat(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
        hostname: &str,
    ) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE consumer_instances \
             SET `heartbeat` = UTC_TIMESTAMP(3), `active` = TRUE, `hostname` = ? \
             WHERE `group` = ? AND `topic` = ? AND `instance_id` = ?",
        )
        .bind(hostname)
        .bind(group)
        .bind(topic)
        .bind(instance_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected > 0 {
            return Ok(());
        }
        let result = sqlx::query(
            "INSERT INTO consumer_instances \
             (`group`, `topic`, `instance_id`, `hostname`, `active`, `heartbeat`) \
             VALUES (?, ?, ?, ?, TRUE, UTC_TIMESTAMP(3))",
        )
        .bind(group)
        .bind(topic)
        .bind(instance_id)
        .bind(hostname)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            // Raced our own earlier insert; the row exists, which is all we need.
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_instance_inactive(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE consumer_instances SET `active` = FALSE \
             WHERE `group` = ? AND `topic` = ? AND `instance_id` = ?",
        )
        .bind(group)
        .bind(topic)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active_instances(
        &self,
        group: &str,
        topic: &str,
        liveness: Duration,
    ) -> Result<Vec<ConsumerInstance>> {
        let rows: Vec<(String, String, String, String, bool, DateTime<Utc>)> = sqlx::query_as(
            "SELECT `group`, `topic`, `instance_id`, `hostname`, `active`, `heartbeat` \
             FROM consumer_instances \
             WHERE `group` = ? AND `topic` = ? AND `active` = TRUE \
               AND `heartbeat` > DATE_SUB(UTC_TIMESTAMP(3), INTERVAL ? SECOND) \
             ORDER BY `instance_id`",
        )
        .bind(group)
        .bind(topic)
        .bind(liveness.as_secs() as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(instance_from_row).collect())
    }

    async fn list_instances(
        &self,
        topic: &str,
        group: Option<&str>,
    ) -> Result<Vec<ConsumerInstance>> {
        let mut sql = String::from(
            "SELECT `group`, `topic`, `instance_id`, `hostname`, `active`, `heartbeat` \
             FROM consumer_instances WHERE `topic` = ?",
        );
        if group.is_some() {
            sql.push_str(" AND `group` = ?");
        }
        sql.push_str(" ORDER BY `group`, `instance_id`");

        let mut query =
            sqlx::query_as::<_, (String, String, String, String, bool, DateTime<Utc>)>(&sql)
                .bind(topic);
        if let Some(group) = group {
            query = query.bind(group);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(instance_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Assignment and offsets
    // ------------------------------------------------------------------

    async fn apply_assignments(&self, assignments: &[PartitionAssignment]) -> Result<()> {
        if assignments.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for a in assignments {
            let updated = sqlx::query(
                "UPDATE consumer_offsets SET `instance_id` = ? \
                 WHERE `group` = ? AND `topic` = ? AND `partition` = ?",
            )
            .bind(&a.instance_id)
            .bind(&a.group)
            .bind(&a.topic)
            .bind(a.partition)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if updated == 0 {
                let inserted = sqlx::query(
                    "INSERT INTO consumer_offsets \
                     (`group`, `topic`, `partition`, `offset`, `instance_id`) \
                     VALUES (?, ?, ?, -1, ?)",
                )
                .bind(&a.group)
                .bind(&a.topic)
                .bind(a.partition)
                .bind(&a.instance_id)
                .execute(&mut *tx)
                .await;
                match inserted {
                    Ok(_) => {}
                    // Another writer created the row first; theirs stands.
                    Err(e) if is_duplicate_key(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn committed_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT `offset` FROM consumer_offsets \
             WHERE `group` = ? AND `topic` = ? AND `partition` = ? AND `instance_id` = ?",
        )
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(offset,)| offset))
    }

    async fn commit_offset(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        instance_id: &str,
        offset: i64,
    ) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE consumer_offsets SET `offset` = ? \
             WHERE `group` = ? AND `topic` = ? AND `partition` = ? AND `instance_id` = ?",
        )
        .bind(offset)
        .bind(group)
        .bind(topic)
        .bind(partition)
        .bind(instance_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::LostOwnership);
        }
        Ok(())
    }

    async fn partitions_for_instance(
        &self,
        group: &str,
        topic: &str,
        instance_id: &str,
    ) -> Result<Vec<u32>> {
        let rows: Vec<(u32,)> = sqlx::query_as(
            "SELECT `partition` FROM consumer_offsets \
             WHERE `group` = ? AND `topic` = ? AND `instance_id` = ? ORDER BY `partition`",
        )
        .bind(group)
        .bind(topic)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn list_offsets(&self, topic: &str, group: Option<&str>) -> Result<Vec<ConsumerOffset>> {
        let mut sql = String::from(
            "SELECT `group`, `topic`, `partition`, `offset`, `instance_id` \
             FROM consumer_offsets WHERE `topic` = ?",
        );
        if group.is_some() {
            sql.push_str(" AND `group` = ?");
        }
        sql.push_str(" ORDER BY `group`, `partition`");

        let mut query = sqlx::query_as::<_, (String, String, u32, i64, String)>(&sql).bind(topic);
        if let Some(group) = group {
            query = query.bind(group);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(
                |(group, topic, partition, offset, instance_id)| ConsumerOffset {
                    group,
                    topic,
                    partition,
                    offset,
                    instance_id,
                },
            )
            .collect())
    }

    async fn delete_offsets_for_topic(&self, topic: &str) -> Result<()> {
        sqlx::query("DELETE FROM consumer_offsets WHERE `topic` = ?")
            .bind(topic)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn purge_expired_messages(
        &self,
        topic: &str,
        partition: u32,
        retention_days: u32,
    ) -> Result<u64> {
        let table = Self::message_table(topic, partition)?;
        let result = sqlx::query(&format!(
            "DELETE FROM `{table}` \
             WHERE `born_time` < DATE_SUB(UTC_TIMESTAMP(3), INTERVAL ? DAY)"
        ))
        .bind(retention_days)
        .execute(&self.pool)
        .await;
        match result {
            Ok(r) => Ok(r.rows_affected()),
            Err(e) if is_missing_table(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn reap_instances(&self, liveness: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM consumer_instances \
             WHERE `active` = FALSE \
                OR `heartbeat` < DATE_SUB(UTC_TIMESTAMP(3), INTERVAL ? SECOND)",
        )
        .bind(liveness.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Advisory locks
    // ------------------------------------------------------------------

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        // Detached from the pool: the lock must live exactly as long as this
        // session, and pooled connections are reused across callers.
        let mut conn = self.pool.acquire().await?.detach();
        let row: (Option<i64>,) = sqlx::query_as("SELECT GET_LOCK(?, ?)")
            .bind(name)
            .bind(timeout.as_secs().min(i64::MAX as u64) as i64)
            .fetch_one(&mut conn)
            .await?;
        if row.0 == Some(1) {
            self.locks.lock().await.insert(name.to_string(), conn);
            debug!(lock = name, "acquired advisory lock");
            Ok(true)
        } else {
            // 0 = timed out waiting on another holder, NULL = server error.
            Ok(false)
        }
    }

    async fn release_lock(&self, name: &str) -> Result<()> {
        if let Some(mut conn) = self.locks.lock().await.remove(name) {
            sqlx::query("SELECT RELEASE_LOCK(?)")
                .bind(name)
                .execute(&mut conn)
                .await?;
            debug!(lock = name, "released advisory lock");
            // The pinned session closes when `conn` drops here.
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let held: Vec<String> = self.locks.lock().await.keys().cloned().collect();
        for name in held {
            let _ = self.release_lock(&name).await;
        }
        self.pool.close().await;
        Ok(())
    }
}

fn instance_from_row(
    (group, topic, instance_id, hostname, active, heartbeat): (
        String,
        String,
        String,
        String,
        bool,
        DateTime<Utc>,
    ),
) -> ConsumerInstance {
    ConsumerInstance {
        group,
        topic,
        instance_id,
        hostname,
        active,
        heartbeat,
    }
}
