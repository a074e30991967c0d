//! `db` crate: persistence for the workflow engine.
//!
//! Provides typed row structs, the store traits the engine talks to, a
//! transaction helper, an in-memory store and a Postgres store with embedded
//! migrations. No workflow business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;
pub mod tx;

pub use error::DbError;
pub use memory::{FailPoint, MemoryObjectStore, MemoryStore};
pub use pool::DbPool;
pub use postgres::PgStore;
pub use store::{ObjectStore, WorkflowStore, WorkflowTx};
pub use tx::{with_tx, TxError, TxStage};
