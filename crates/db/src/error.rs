//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    /// A uniqueness constraint rejected the write.
    #[error("constraint violation: {0}")]
    Conflict(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure raised on purpose by the in-memory store.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl DbError {
    /// Maps Postgres unique violations (SQLSTATE 23505) onto [`DbError::Conflict`].
    pub(crate) fn from_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return DbError::Conflict(db_err.message().to_string());
            }
        }
        DbError::Sqlx(err)
    }
}
