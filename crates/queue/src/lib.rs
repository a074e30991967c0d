//! `queue` crate: the durable event-delivery runtime.
//!
//! The engine emits lifecycle events through [`Runtime::emit_with_headers`]
//! and its workers take queued jobs back off through [`Consumer`].
//! Two runtimes ship here: [`MemoryRuntime`] for tests and embedding, and
//! [`PgRuntime`], a `workflow_event_queue` table polled with
//! `SELECT … FOR UPDATE SKIP LOCKED`.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod runtime;

pub use error::QueueError;
pub use memory::MemoryRuntime;
pub use postgres::PgRuntime;
pub use runtime::{Consumer, Delivery, Envelope, Headers, Receipt, Runtime};
