//! Queue error type.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The runtime could not accept the event right now.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("payload could not be encoded: {0}")]
    Encode(String),

    #[error("queue storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}
