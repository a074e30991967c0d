//! Assignment and assignment-target persistence.

use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{
    NewWorkflowAssignment, NewWorkflowAssignmentTarget, WorkflowAssignmentRow, WorkflowAssignmentTargetRow,
};
use crate::DbError;

const COLUMNS: &str = "id, workflow_instance_id, owner_id, assignment_key, action_key, status, required, \
                       label, metadata, decided_by, decided_at, notes, created_at, updated_at";

const TARGET_COLUMNS: &str =
    "id, workflow_assignment_id, owner_id, target_type, target_user_id, resolver_key, created_at";

pub async fn create_assignment<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowAssignment,
) -> Result<WorkflowAssignmentRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_assignments
            (id, workflow_instance_id, owner_id, assignment_key, action_key, status, required,
             label, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_instance_id)
    .bind(&row.owner_id)
    .bind(&row.assignment_key)
    .bind(&row.action_key)
    .bind(row.status)
    .bind(row.required)
    .bind(&row.label)
    .bind(&row.metadata)
    .bind(row.created_at)
    .execute(exec)
    .await
    .map_err(DbError::from_write)?;

    Ok(row)
}

pub async fn create_assignment_target<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowAssignmentTarget,
) -> Result<WorkflowAssignmentTargetRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_assignment_targets
            (id, workflow_assignment_id, owner_id, target_type, target_user_id, resolver_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_assignment_id)
    .bind(&row.owner_id)
    .bind(&row.target_type)
    .bind(&row.target_user_id)
    .bind(&row.resolver_key)
    .bind(row.created_at)
    .execute(exec)
    .await?;

    Ok(row)
}

pub async fn get_assignment<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<WorkflowAssignmentRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_assignments WHERE id = $1");
    sqlx::query_as::<_, WorkflowAssignmentRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_assignments<'e>(
    exec: impl PgExecutor<'e>,
    instance_id: Uuid,
) -> Result<Vec<WorkflowAssignmentRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflow_assignments WHERE workflow_instance_id = $1 \
         ORDER BY created_at ASC, assignment_key ASC"
    );
    let rows = sqlx::query_as::<_, WorkflowAssignmentRow>(&sql)
        .bind(instance_id)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn list_assignment_targets<'e>(
    exec: impl PgExecutor<'e>,
    assignment_id: Uuid,
) -> Result<Vec<WorkflowAssignmentTargetRow>, DbError> {
    let sql = format!("SELECT {TARGET_COLUMNS} FROM workflow_assignment_targets WHERE workflow_assignment_id = $1");
    let rows = sqlx::query_as::<_, WorkflowAssignmentTargetRow>(&sql)
        .bind(assignment_id)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn update_assignment<'e>(exec: impl PgExecutor<'e>, row: &WorkflowAssignmentRow) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_assignments
        SET status = $1, metadata = $2, decided_by = $3, decided_at = $4, notes = $5, updated_at = $6
        WHERE id = $7
        "#,
    )
    .bind(row.status)
    .bind(&row.metadata)
    .bind(&row.decided_by)
    .bind(row.decided_at)
    .bind(&row.notes)
    .bind(Utc::now())
    .bind(row.id)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn delete_assignment_targets<'e>(exec: impl PgExecutor<'e>, instance_ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query(
        r#"
        DELETE FROM workflow_assignment_targets t
        USING workflow_assignments a
        WHERE t.workflow_assignment_id = a.id AND a.workflow_instance_id = ANY($1)
        "#,
    )
    .bind(instance_ids)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_assignments<'e>(exec: impl PgExecutor<'e>, instance_ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM workflow_assignments WHERE workflow_instance_id = ANY($1)")
        .bind(instance_ids)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
