//! `engine` crate: the workflow and approval engine.
//!
//! A host reports each mutation of a business object; the engine matches it
//! against the owner's workflow definitions, holds pre-commit changes back
//! as proposals, runs approval, notification and automation actions, and
//! delivers lifecycle events with reconciliation of failed emissions.
//! Executor-backed actions run off the mutation path on an
//! [`worker::ActionWorker`].

pub mod assignment;
pub mod cel;
pub mod changeset;
pub mod cleanup;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod emit;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod object;
pub mod observability;
pub mod proposal;
pub mod reconcile;
pub mod targets;
pub mod trigger;
pub mod validate;
pub mod worker;

pub use assignment::{evaluate_quorum, AssignmentDecision, AssignmentResolution, QuorumOutcome};
pub use cel::{CelEvaluator, ExpressionScope};
pub use changeset::{Mutation, RecordedMutation};
pub use cleanup::cleanup_orphan_workflow_instances;
pub use config::{
    ActionDispatch, CelConfig, EligibilityPolicy, ExecutorConfig, ReconcilerConfig, WorkerConfig, WorkflowConfig,
};
pub use dispatch::ActionOutcome;
pub use emit::{emit_workflow_event, EmitReceipt, LifecycleEvent, WorkflowEmitter};
pub use error::{CreationStage, EngineError, WorkflowCreationError};
pub use executor::{ActionRegistry, TriggerInput, WorkflowEngine, WorkflowEngineBuilder};
pub use models::{ActionType, Caller, WorkflowDefinitionDocument};
pub use object::{Fielder, Object, ObjectType, WorkflowRegistry};
pub use proposal::{RouteOutcome, RoutedProposal};
pub use reconcile::{ReconcileReport, Reconciler};
pub use validate::{validate_definition, validate_definition_value};
pub use worker::{ActionJob, ActionWorker, JobOutcome};
