//! Postgres-backed [`WorkflowStore`], delegating to [`crate::repository`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::models::*;
use crate::repository::{assignments, definitions, events, instances, object_refs, proposals};
use crate::store::*;
use crate::{DbError, DbPool};

/// Workflow store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// An open Postgres transaction. Dropping it without commit rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WorkflowStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, DbError> {
        Ok(PgTx { tx: self.pool.begin().await? })
    }

    async fn create_definition(&self, new: NewWorkflowDefinition) -> Result<WorkflowDefinitionRow, DbError> {
        definitions::create_definition(&self.pool, new).await
    }

    async fn get_definition(&self, id: Uuid) -> Result<WorkflowDefinitionRow, DbError> {
        definitions::get_definition(&self.pool, id).await
    }

    async fn list_definitions(&self, filter: &DefinitionFilter) -> Result<Vec<WorkflowDefinitionRow>, DbError> {
        definitions::list_definitions(&self.pool, filter).await
    }

    async fn soft_delete_definition(&self, id: Uuid) -> Result<(), DbError> {
        definitions::soft_delete_definition(&self.pool, id).await
    }

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstanceRow, DbError> {
        instances::get_instance(&self.pool, id).await
    }

    async fn find_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstanceRow>, DbError> {
        instances::find_instances(&self.pool, filter).await
    }

    async fn update_instance_state(&self, id: Uuid, state: InstanceState) -> Result<(), DbError> {
        instances::update_instance_state(&self.pool, id, state).await
    }

    async fn update_instance_progress(&self, id: Uuid, current_action_index: i32, context: Value) -> Result<(), DbError> {
        instances::update_instance_progress(&self.pool, id, current_action_index, context).await
    }

    async fn find_orphan_instance_ids(&self, owner_id: Option<&str>) -> Result<Vec<Uuid>, DbError> {
        instances::find_orphan_instance_ids(&self.pool, owner_id).await
    }

    async fn find_object_refs(&self, owner_id: &str, filter: &ObjectRefFilter) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
        object_refs::find_object_refs(&self.pool, owner_id, filter).await
    }

    async fn object_refs_for_instance(&self, instance_id: Uuid) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
        object_refs::object_refs_for_instance(&self.pool, instance_id).await
    }

    async fn get_proposal(&self, id: Uuid) -> Result<WorkflowProposalRow, DbError> {
        proposals::get_proposal(&self.pool, id).await
    }

    async fn find_proposals(&self, query: &ProposalQuery) -> Result<Vec<WorkflowProposalRow>, DbError> {
        proposals::find_proposals(&self.pool, query).await
    }

    async fn update_proposal(&self, row: &WorkflowProposalRow) -> Result<(), DbError> {
        proposals::update_proposal(&self.pool, row).await
    }

    async fn create_assignment(&self, new: NewWorkflowAssignment) -> Result<WorkflowAssignmentRow, DbError> {
        assignments::create_assignment(&self.pool, new).await
    }

    async fn create_assignment_target(&self, new: NewWorkflowAssignmentTarget) -> Result<WorkflowAssignmentTargetRow, DbError> {
        assignments::create_assignment_target(&self.pool, new).await
    }

    async fn get_assignment(&self, id: Uuid) -> Result<WorkflowAssignmentRow, DbError> {
        assignments::get_assignment(&self.pool, id).await
    }

    async fn list_assignments(&self, instance_id: Uuid) -> Result<Vec<WorkflowAssignmentRow>, DbError> {
        assignments::list_assignments(&self.pool, instance_id).await
    }

    async fn list_assignment_targets(&self, assignment_id: Uuid) -> Result<Vec<WorkflowAssignmentTargetRow>, DbError> {
        assignments::list_assignment_targets(&self.pool, assignment_id).await
    }

    async fn update_assignment(&self, row: &WorkflowAssignmentRow) -> Result<(), DbError> {
        assignments::update_assignment(&self.pool, row).await
    }

    async fn create_event(&self, new: NewWorkflowEvent) -> Result<WorkflowEventRow, DbError> {
        events::create_event(&self.pool, new).await
    }

    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<WorkflowEventRow>, DbError> {
        events::list_events(&self.pool, instance_id).await
    }

    async fn claim_events(&self, event_type: EventType, limit: usize, lease: Duration) -> Result<Vec<WorkflowEventRow>, DbError> {
        events::claim_events(&self.pool, event_type, limit, lease).await
    }

    async fn update_event(&self, id: Uuid, event_type: EventType, payload: Value) -> Result<(), DbError> {
        events::update_event(&self.pool, id, event_type, payload).await
    }
}

#[async_trait]
impl WorkflowTx for PgTx {
    async fn create_instance(&mut self, new: NewWorkflowInstance) -> Result<WorkflowInstanceRow, DbError> {
        instances::create_instance(&mut *self.tx, new).await
    }

    async fn create_object_ref(&mut self, new: NewWorkflowObjectRef) -> Result<WorkflowObjectRefRow, DbError> {
        object_refs::create_object_ref(&mut *self.tx, new).await
    }

    async fn create_proposal(&mut self, new: NewWorkflowProposal) -> Result<WorkflowProposalRow, DbError> {
        proposals::create_proposal(&mut *self.tx, new).await
    }

    async fn set_instance_proposal(&mut self, instance_id: Uuid, proposal_id: Uuid) -> Result<(), DbError> {
        instances::set_instance_proposal(&mut *self.tx, instance_id, proposal_id).await
    }

    async fn proposal_ids_for_instances(&mut self, instance_ids: &[Uuid]) -> Result<Vec<Uuid>, DbError> {
        proposals::proposal_ids_for_instances(&mut *self.tx, instance_ids).await
    }

    async fn delete_assignment_targets(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        assignments::delete_assignment_targets(&mut *self.tx, instance_ids).await
    }

    async fn delete_assignments(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        assignments::delete_assignments(&mut *self.tx, instance_ids).await
    }

    async fn delete_proposals(&mut self, proposal_ids: &[Uuid]) -> Result<u64, DbError> {
        proposals::delete_proposals(&mut *self.tx, proposal_ids).await
    }

    async fn delete_object_refs(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        object_refs::delete_object_refs(&mut *self.tx, instance_ids).await
    }

    async fn delete_events(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        events::delete_events(&mut *self.tx, instance_ids).await
    }

    async fn delete_instances(&mut self, instance_ids: &[Uuid]) -> Result<u64, DbError> {
        instances::delete_instances(&mut *self.tx, instance_ids).await
    }

    async fn commit(self) -> Result<(), DbError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
