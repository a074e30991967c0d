//! Engine-level error types.
//!
//! Every failure a caller may want to branch on has its own variant, so
//! callers use `matches!` instead of inspecting messages.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use db::models::{InstanceState, ProposalState};
use db::{DbError, TxError};
use queue::QueueError;

use crate::emit::EmitError;

/// Which row of the instance + object-ref pair failed to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    Instance,
    ObjectRef,
    Proposal,
}

impl std::fmt::Display for CreationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::ObjectRef => write!(f, "object_ref"),
            Self::Proposal => write!(f, "proposal"),
        }
    }
}

/// Failure while creating workflow rows inside a transaction.
#[derive(Debug, Error)]
#[error("failed to create workflow {stage}: {source}")]
pub struct WorkflowCreationError {
    pub stage: CreationStage,
    #[source]
    pub source: DbError,
}

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Caller / collaborator errors ------

    /// The engine was asked to persist without a store.
    #[error("workflow store is not configured")]
    NoStoreConfigured,

    #[error("no authenticated caller")]
    NoAuthenticatedCaller,

    #[error("organization id is required")]
    MissingOrganization,

    #[error("missing object ID")]
    MissingObjectId,

    #[error("unsupported object type '{0}'")]
    UnsupportedObjectType(String),

    #[error("object {object_type}/{object_id} not found")]
    ObjectNotFound {
        object_type: String,
        object_id: String,
    },

    // ------ Definition errors ------

    /// A `REQUEST_APPROVAL` action's params could not be parsed.
    #[error("approval action params invalid: action '{action_key}': {source}")]
    ApprovalParamsInvalid {
        action_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse params for action '{action_key}': {source}")]
    InvalidActionParams {
        action_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid workflow definition document: {0}")]
    InvalidDefinition(#[source] serde_json::Error),

    #[error("definition validation failed: {}", .0.join("; "))]
    DefinitionInvalid(Vec<String>),

    #[error("missing required field '{0}'")]
    MissingRequiredField(String),

    #[error("field '{field}' is not workflow-eligible for {object_type}")]
    FieldNotEligible { field: String, object_type: String },

    #[error("no approval targets resolved for action '{0}'")]
    ApprovalNoTargets(String),

    #[error("no review targets resolved for action '{0}'")]
    ReviewNoTargets(String),

    // ------ Expression errors ------

    #[error("failed to compile expression '{expression}': {message}")]
    CelCompile { expression: String, message: String },

    #[error("failed to evaluate expression '{expression}': {message}")]
    CelEvaluation { expression: String, message: String },

    #[error("expression '{0}' did not evaluate to a boolean")]
    CelTypeMismatch(String),

    #[error("expression '{expression}' exceeded the {timeout:?} evaluation timeout")]
    CelTimeout { expression: String, timeout: Duration },

    #[error("expression '{expression}' estimated cost {cost} exceeds limit {limit}")]
    CelCostLimit { expression: String, cost: u64, limit: u64 },

    #[error("expression '{expression}' may run {iterations} comprehension iterations, limit {limit}")]
    CelIterationLimit { expression: String, iterations: u64, limit: u64 },

    // ------ State errors ------

    #[error("workflow already active for this object (instance {0})")]
    WorkflowAlreadyActive(Uuid),

    #[error("invalid instance transition {from} -> {to}")]
    InvalidInstanceTransition { from: InstanceState, to: InstanceState },

    #[error("invalid proposal transition {from} -> {to}")]
    InvalidProposalTransition { from: ProposalState, to: ProposalState },

    #[error("assignment {0} has already been decided")]
    AssignmentAlreadyDecided(Uuid),

    #[error("user '{user_id}' is not a target of assignment {assignment_id}")]
    NotAssignmentTarget { assignment_id: Uuid, user_id: String },

    // ------ Execution errors ------

    #[error("action '{action_key}' failed fatally: {message}")]
    ActionFatal { action_key: String, message: String },

    #[error("action '{action_key}' exceeded retry limit: {message}")]
    ActionRetryExhausted { action_key: String, message: String },

    #[error("event emission failed: {0}")]
    Emit(#[from] EmitError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    // ------ Persistence errors ------

    #[error(transparent)]
    Creation(#[from] WorkflowCreationError),

    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// True for errors caused by a malformed definition rather than runtime state.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::ApprovalParamsInvalid { .. }
                | Self::InvalidActionParams { .. }
                | Self::InvalidDefinition(_)
                | Self::DefinitionInvalid(_)
                | Self::CelCompile { .. }
        )
    }
}
