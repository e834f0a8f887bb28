//! Client error types.

use furrow_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the public broker API.
///
/// Background loops never surface errors through this type: they log and
/// keep going. Only on-path operations (sends, subscriptions, admin calls,
/// connect/close) return it.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker was misconfigured or misused (e.g. a reserved group name).
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker has been closed; no further operations are accepted.
    #[error("broker is closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}
