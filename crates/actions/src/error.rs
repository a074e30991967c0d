//! Action-level error type.

use thiserror::Error;

/// Errors returned by [`crate::ActionExecutor::execute`].
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: retried with exponential back-off up to the configured limit.
/// - `Fatal`: the action fails immediately and the instance is failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("retryable action error: {0}")]
    Retryable(String),

    #[error("fatal action error: {0}")]
    Fatal(String),
}
