//! Proposal persistence.
//!
//! The partial unique index `workflow_proposals_open_domain` makes a second
//! open proposal for the same object and domain fail with `DbError::Conflict`.

use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{NewWorkflowProposal, ProposalQuery, WorkflowProposalRow};
use crate::DbError;

const COLUMNS: &str = "id, workflow_object_ref_id, owner_id, object_type, object_id, domain_key, state, \
                       changes, proposed_hash, revision, submitted_at, submitted_by, created_at, updated_at";

pub async fn create_proposal<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowProposal,
) -> Result<WorkflowProposalRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_proposals
            (id, workflow_object_ref_id, owner_id, object_type, object_id, domain_key, state,
             changes, proposed_hash, revision, submitted_at, submitted_by, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_object_ref_id)
    .bind(&row.owner_id)
    .bind(&row.object_type)
    .bind(&row.object_id)
    .bind(&row.domain_key)
    .bind(row.state)
    .bind(&row.changes)
    .bind(&row.proposed_hash)
    .bind(row.revision)
    .bind(row.submitted_at)
    .bind(&row.submitted_by)
    .bind(row.created_at)
    .execute(exec)
    .await
    .map_err(DbError::from_write)?;

    Ok(row)
}

pub async fn get_proposal<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<WorkflowProposalRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_proposals WHERE id = $1");
    sqlx::query_as::<_, WorkflowProposalRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn find_proposals<'e>(
    exec: impl PgExecutor<'e>,
    query: &ProposalQuery,
) -> Result<Vec<WorkflowProposalRow>, DbError> {
    let states: Vec<String> = query.states.iter().map(|s| s.to_string()).collect();
    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM workflow_proposals
        WHERE owner_id = $1 AND domain_key = $2
          AND workflow_object_ref_id = ANY($3)
          AND (cardinality($4::text[]) = 0 OR state = ANY($4))
        ORDER BY updated_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, WorkflowProposalRow>(&sql)
        .bind(&query.owner_id)
        .bind(&query.domain_key)
        .bind(&query.object_ref_ids)
        .bind(&states)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn update_proposal<'e>(exec: impl PgExecutor<'e>, row: &WorkflowProposalRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_proposals
        SET state = $1, changes = $2, proposed_hash = $3, revision = $4,
            submitted_at = $5, submitted_by = $6, updated_at = $7
        WHERE id = $8
        "#,
    )
    .bind(row.state)
    .bind(&row.changes)
    .bind(&row.proposed_hash)
    .bind(row.revision)
    .bind(row.submitted_at)
    .bind(&row.submitted_by)
    .bind(Utc::now())
    .bind(row.id)
    .execute(exec)
    .await
    .map_err(DbError::from_write)?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

/// Proposals reachable from the instances, through object refs or the
/// instance's own `workflow_proposal_id`.
pub async fn proposal_ids_for_instances<'e>(
    exec: impl PgExecutor<'e>,
    instance_ids: &[Uuid],
) -> Result<Vec<Uuid>, DbError> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT p.id FROM workflow_proposals p
        JOIN workflow_object_refs r ON r.id = p.workflow_object_ref_id
        WHERE r.workflow_instance_id = ANY($1)
        UNION
        SELECT i.workflow_proposal_id FROM workflow_instances i
        WHERE i.id = ANY($1) AND i.workflow_proposal_id IS NOT NULL
        "#,
    )
    .bind(instance_ids)
    .fetch_all(exec)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

pub async fn delete_proposals<'e>(exec: impl PgExecutor<'e>, ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM workflow_proposals WHERE id = ANY($1)")
        .bind(ids)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
