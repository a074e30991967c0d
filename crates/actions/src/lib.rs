//! `actions` crate: the contract for side-effecting workflow actions.
//!
//! The engine decides *when* an action runs and records the attempt; what a
//! `NOTIFY`, `WEBHOOK`, `INTEGRATION` or `CREATE_OBJECT` action actually does
//! is supplied by the host through [`ActionExecutor`].

pub mod error;
pub mod mock;
pub mod traits;

pub use error::ActionError;
pub use traits::{ActionExecutor, ActionRequest};
