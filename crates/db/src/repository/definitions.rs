//! Workflow definition CRUD.

use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{NewWorkflowDefinition, WorkflowDefinitionRow};
use crate::store::DefinitionFilter;
use crate::DbError;

const COLUMNS: &str = "id, owner_id, name, schema_type, active, draft, cooldown_seconds, \
                       definition, deleted_at, created_at, updated_at";

pub async fn create_definition<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowDefinition,
) -> Result<WorkflowDefinitionRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_definitions
            (id, owner_id, name, schema_type, active, draft, cooldown_seconds, definition, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        "#,
    )
    .bind(row.id)
    .bind(&row.owner_id)
    .bind(&row.name)
    .bind(&row.schema_type)
    .bind(row.active)
    .bind(row.draft)
    .bind(row.cooldown_seconds)
    .bind(&row.definition)
    .bind(row.created_at)
    .execute(exec)
    .await?;

    Ok(row)
}

pub async fn get_definition<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<WorkflowDefinitionRow, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_definitions WHERE id = $1");
    sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?
        .ok_or(DbError::NotFound)
}

/// Active definitions for an owner and schema type. When `operation` is set,
/// only definitions with a trigger for that operation (or with a trigger that
/// names no operation) are returned.
pub async fn list_definitions<'e>(
    exec: impl PgExecutor<'e>,
    filter: &DefinitionFilter,
) -> Result<Vec<WorkflowDefinitionRow>, DbError> {
    let sql = format!(
        r#"
        SELECT {COLUMNS} FROM workflow_definitions d
        WHERE d.owner_id = $1
          AND lower(d.schema_type) = lower($2)
          AND d.active AND NOT d.draft AND d.deleted_at IS NULL
          AND (
            $3::text IS NULL OR EXISTS (
              SELECT 1 FROM jsonb_array_elements(d.definition -> 'triggers') t
              WHERE coalesce(trim(t ->> 'operation'), '') = ''
                 OR upper(t ->> 'operation') = upper($3)
            )
          )
        ORDER BY d.created_at ASC
        "#
    );
    let rows = sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
        .bind(&filter.owner_id)
        .bind(&filter.schema_type)
        .bind(filter.operation.as_deref())
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn soft_delete_definition<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE workflow_definitions SET deleted_at = $1, updated_at = $1 WHERE id = $2")
        .bind(Utc::now())
        .bind(id)
        .execute(exec)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}
