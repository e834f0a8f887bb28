//! Store error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by [`BrokerStore`](crate::BrokerStore) operations.
///
/// Two variants are signals rather than failures and are matched on by the
/// consumption engine:
///
/// - [`StoreError::LostOwnership`]: an offset commit matched zero rows, which
///   means a rebalance moved the partition to another instance. The worker
///   aborts its batch and picks up its new assignment on the next refresh.
/// - [`StoreError::DuplicateMessage`]: an insert hit the `message_id` unique
///   key. The delay promoter treats this as "already promoted" when
///   recovering from a crash between save and delete.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Topic name is empty, too long, or outside `[A-Za-z0-9_-]`.
    #[error("invalid topic name {0:?}")]
    InvalidTopic(String),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("topic already exists: {0}")]
    TopicExists(String),

    /// The topic still has live consumer instances and cannot be deleted.
    #[error("topic {0} has active consumers")]
    TopicInUse(String),

    /// A message with this id already exists in the target partition.
    #[error("duplicate message id {0}")]
    DuplicateMessage(String),

    /// An offset commit affected zero rows: the partition was reassigned.
    #[error("offset commit lost partition ownership")]
    LostOwnership,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
