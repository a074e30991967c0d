//! Workflow instance persistence and orphan discovery.

use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{InstanceState, NewWorkflowInstance, WorkflowInstanceRow};
use crate::store::InstanceFilter;
use crate::DbError;

const COLUMNS: &str = "id, workflow_definition_id, owner_id, state, object_type, object_id, domain_key, \
                       context, definition_snapshot, workflow_proposal_id, current_action_index, \
                       created_at, updated_at";

pub async fn create_instance<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowInstance,
) -> Result<WorkflowInstanceRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_instances
            (id, workflow_definition_id, owner_id, state, object_type, object_id, domain_key,
             context, definition_snapshot, current_action_index, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_definition_id)
    .bind(&row.owner_id)
    .bind(row.state)
    .bind(&row.object_type)
    .bind(&row.object_id)
    .bind(&row.domain_key)
    .bind(&row.context)
    .bind(&row.definition_snapshot)
    .bind(row.current_action_index)
    .bind(row.created_at)
    .execute(exec)
    .await
    .map_err(DbError::from_write)?;

    Ok(row)
}

pub async fn get_instance<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<WorkflowInstanceRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_instances WHERE id = $1");
    sqlx::query_as::<_, WorkflowInstanceRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn find_instances<'e>(
    exec: impl PgExecutor<'e>,
    filter: &InstanceFilter,
) -> Result<Vec<WorkflowInstanceRow>, DbError> {
    let states: Vec<String> = filter.states.iter().map(|s| s.to_string()).collect();
    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM workflow_instances
        WHERE owner_id = $1 AND object_type = $2 AND object_id = $3
          AND ($4::uuid IS NULL OR workflow_definition_id = $4)
          AND ($5::text IS NULL OR domain_key = $5)
          AND (cardinality($6::text[]) = 0 OR state = ANY($6))
          AND ($7::timestamptz IS NULL OR created_at > $7)
        ORDER BY created_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, WorkflowInstanceRow>(&sql)
        .bind(&filter.owner_id)
        .bind(&filter.object_type)
        .bind(&filter.object_id)
        .bind(filter.workflow_definition_id)
        .bind(filter.domain_key.as_deref())
        .bind(&states)
        .bind(filter.created_after)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn update_instance_state<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    state: InstanceState,
) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE workflow_instances SET state = $1, updated_at = $2 WHERE id = $3")
        .bind(state)
        .bind(Utc::now())
        .bind(id)
        .execute(exec)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn update_instance_progress<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    current_action_index: i32,
    context: serde_json::Value,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE workflow_instances SET current_action_index = $1, context = $2, updated_at = $3 WHERE id = $4",
    )
    .bind(current_action_index)
    .bind(context)
    .bind(Utc::now())
    .bind(id)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn set_instance_proposal<'e>(
    exec: impl PgExecutor<'e>,
    instance_id: Uuid,
    proposal_id: Uuid,
) -> Result<(), DbError> {
    sqlx::query("UPDATE workflow_instances SET workflow_proposal_id = $1, updated_at = $2 WHERE id = $3")
        .bind(proposal_id)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Instances whose definition row is missing or soft-deleted.
pub async fn find_orphan_instance_ids<'e>(
    exec: impl PgExecutor<'e>,
    owner_id: Option<&str>,
) -> Result<Vec<Uuid>, DbError> {
    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT i.id FROM workflow_instances i
        LEFT JOIN workflow_definitions d ON d.id = i.workflow_definition_id
        WHERE (d.id IS NULL OR d.deleted_at IS NOT NULL)
          AND ($1::text IS NULL OR i.owner_id = $1)
        ORDER BY i.id
        "#,
    )
    .bind(owner_id)
    .fetch_all(exec)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

pub async fn delete_instances<'e>(exec: impl PgExecutor<'e>, ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM workflow_instances WHERE id = ANY($1)")
        .bind(ids)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
