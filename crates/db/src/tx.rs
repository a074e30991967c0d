//! Run a closure inside a store transaction.

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

use crate::store::{WorkflowStore, WorkflowTx};
use crate::DbError;

/// Which part of the transaction lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Commit,
}

impl std::fmt::Display for TxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Commit => write!(f, "commit"),
        }
    }
}

/// A begin/commit failure. "never started" and "ran but didn't persist" are
/// distinguishable through `stage`.
#[derive(Debug, Error)]
#[error("transaction {stage} failed: {source}")]
pub struct TxError {
    pub stage: TxStage,
    #[source]
    pub source: DbError,
}

/// Begin a transaction, run `f`, commit on `Ok`, roll back on `Err`.
///
/// Errors returned by `f` come back exactly as `f` produced them; only begin
/// and commit failures are wrapped in [`TxError`]. If `f` panics the
/// transaction is dropped without commit, which discards it.
pub async fn with_tx<S, T, E, F>(store: &S, f: F) -> Result<T, E>
where
    S: WorkflowStore + ?Sized,
    E: From<TxError> + Send,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
{
    let mut tx = store
        .begin()
        .await
        .map_err(|source| TxError { stage: TxStage::Begin, source })?;

    match f(&mut tx).await {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|source| TxError { stage: TxStage::Commit, source })?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
