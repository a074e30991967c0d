//! Repository functions, one per database operation.
//!
//! Every function takes any Postgres executor (`&PgPool` or a transaction
//! connection) and returns a `Result<T, DbError>`. Plain SQL, no business logic.

pub mod definitions;
pub mod instances;
pub mod object_refs;
pub mod proposals;
pub mod assignments;
pub mod events;
