//! Collaborator traits the engine persists through.
//!
//! [`WorkflowStore`] owns the workflow tables; [`ObjectStore`] is the host's
//! view of the business objects workflows point at. Both are implemented in
//! memory ([`crate::memory`]) and the workflow side on Postgres
//! ([`crate::postgres`]).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::*;
use crate::DbError;

/// Filter for listing definitions eligible for evaluation.
#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub owner_id: String,
    pub schema_type: String,
    /// Restrict to definitions whose trigger operations include this value.
    pub operation: Option<String>,
}

/// Filter for finding instances of one object.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub owner_id: String,
    pub object_type: String,
    pub object_id: String,
    pub workflow_definition_id: Option<Uuid>,
    pub domain_key: Option<String>,
    /// Empty means any state.
    pub states: Vec<InstanceState>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
}

/// Counts reported by cascading deletes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedCounts {
    pub assignment_targets: u64,
    pub assignments: u64,
    pub proposals: u64,
    pub object_refs: u64,
    pub events: u64,
    pub instances: u64,
}

/// Workflow persistence.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    type Tx: WorkflowTx;

    async fn begin(&self) -> Result<Self::Tx, DbError>;

    // ------ definitions ------

    async fn create_definition(&self, new: NewWorkflowDefinition) -> Result<WorkflowDefinitionRow, DbError>;
    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinitionRow, DbError>;
    /// Active, non-draft, non-deleted definitions of one owner and schema type.
    async fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinitionRow>, DbError>;
    async fn soft_delete_definition(&self, id: Uuid) -> Result<(), DbError>;

    // ------ instances ------

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstanceRow, DbError>;
    async fn find_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstanceRow>, DbError>;
    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> Result<(), DbError>;
    async fn update_instance_progress(&self, id: Uuid, current_action_index: i32, context: Value) -> Result<(), DbError>;
    /// Instances whose definition is missing or soft-deleted.
    async fn find_orphan_instance_ids(&self, owner_id: Option<&str>) -> Result<Vec<Uuid>, DbError>;

    // ------ object refs ------

    async fn find_object_refs(&self, owner_id: &str, filter: &ObjectRefFilter) -> Result<Vec<WorkflowObjectRefRow>, DbError>;
    async fn object_refs_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkflowObjectRefRow>, DbError>;

    // ------ proposals ------

    async fn get_proposal(&self, id: Uuid) -> Result<WorkflowProposalRow, DbError>;
    /// Matching proposals, most recently updated first.
    async fn find_proposals(&self, query: &ProposalQuery) -> Result<Vec<WorkflowProposalRow>, DbError>;
    async fn update_proposal(&self, row: &WorkflowProposalRow) -> Result<(), DbError>;

    // ------ assignments ------

    /// Fails with [`DbError::Conflict`] if the instance already has the key.
    async fn create_assignment(&self, new: NewWorkflowAssignment) -> Result<WorkflowAssignmentRow, DbError>;
    async fn create_assignment_target(&self, new: NewWorkflowAssignmentTarget) -> Result<WorkflowAssignmentTargetRow, DbError>;
    async fn get_assignment(&self, id: Uuid) -> Result<WorkflowAssignmentRow, DbError>;
    async fn list_assignments(&self, instance_id: Uuid) -> Result<Vec<WorkflowAssignmentRow>, DbError>;
    async fn list_assignment_targets(&self, assignment_id: Uuid) -> Result<Vec<WorkflowAssignmentTargetRow>, DbError>;
    async fn update_assignment(&self, row: &WorkflowAssignmentRow) -> Result<(), DbError>;

    // ------ events ------

    async fn create_event(&self, new: NewWorkflowEvent) -> Result<WorkflowEventRow, DbError>;
    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<WorkflowEventRow>, DbError>;
    /// Atomically lease up to `limit` unclaimed events of `event_type`.
    async fn claim_events(&self, event_type: EventType, limit: usize, lease: Duration) -> Result<Vec<WorkflowEventRow>, DbError>;
    /// Rewrite an event's type and payload and release its lease.
    async fn update_event(&self, id: Uuid, event_type: EventType, payload: Value) -> Result<(), DbError>;
}

/// Operations that must be atomic with one another.
#[async_trait]
pub trait WorkflowTx: Send + Sized {
    async fn create_instance(&mut self, new: NewWorkflowInstance) -> Result<WorkflowInstanceRow, DbError>;
    async fn create_object_ref(&mut self, new: NewWorkflowObjectRef) -> Result<WorkflowObjectRefRow, DbError>;
    /// Fails with [`DbError::Conflict`] if the slot already holds an open proposal.
    async fn create_proposal(&mut self, new: NewWorkflowProposal) -> Result<WorkflowProposalRow, DbError>;
    async fn set_instance_proposal(&mut self, instance_id: Uuid, proposal_id: Uuid) -> Result<(), DbError>;

    /// Proposals linked through the instances' object refs or directly.
    async fn proposal_ids_for_instances(&mut self, instance_ids: &[Uuid]) -> Result<Vec<Uuid>, DbError>;
    async fn delete_assignment_targets(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError>;
    async fn delete_assignments(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError>;
    async fn delete_proposals(&mut self, proposal_ids: &[Uuid]) -> Result<u64, DbError>;
    async fn delete_object_refs(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError>;
    async fn delete_events(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError>;
    async fn delete_instances(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError>;

    async fn commit(self) -> Result<(), DbError>;
    async fn rollback(self) -> Result<(), DbError>;
}

/// The host's business objects, addressed by type + ID.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// JSON projection of the object; [`DbError::NotFound`] if absent.
    async fn load_object(&self, object_type: &str, id: &str) -> Result<Value, DbError>;
    async fn apply_field_updates(&self, object_type: &str, id: &str, updates: &Map<String, Value>) -> Result<(), DbError>;
    async fn object_owner_id(&self, object_type: &str, id: &str) -> Result<String, DbError>;
    async fn group_member_ids(&self, owner_id: &str, group_id: &str) -> Result<Vec<String>, DbError>;
    async fn role_member_ids(&self, owner_id: &str, role: &str) -> Result<Vec<String>, DbError>;
}
