//! Object reference join rows.

use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{NewWorkflowObjectRef, ObjectRefFilter, WorkflowObjectRefRow};
use crate::DbError;

const COLUMNS: &str = "id, workflow_instance_id, owner_id, object_columns, created_at";

pub async fn create_object_ref<'e>(
    exec: impl PgExecutor<'e>,
    new: NewWorkflowObjectRef,
) -> Result<WorkflowObjectRefRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_object_refs (id, workflow_instance_id, owner_id, object_columns, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_instance_id)
    .bind(&row.owner_id)
    .bind(&row.object_columns)
    .bind(row.created_at)
    .execute(exec)
    .await
    .map_err(DbError::from_write)?;

    Ok(row)
}

pub async fn find_object_refs<'e>(
    exec: impl PgExecutor<'e>,
    owner_id: &str,
    filter: &ObjectRefFilter,
) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM workflow_object_refs \
         WHERE owner_id = $1 AND object_columns ->> $2 = $3 ORDER BY created_at ASC"
    );
    let rows = sqlx::query_as::<_, WorkflowObjectRefRow>(&sql)
        .bind(owner_id)
        .bind(&filter.column)
        .bind(&filter.object_id)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn object_refs_for_instance<'e>(
    exec: impl PgExecutor<'e>,
    instance_id: Uuid,
) -> Result<Vec<WorkflowObjectRefRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_object_refs WHERE workflow_instance_id = $1");
    let rows = sqlx::query_as::<_, WorkflowObjectRefRow>(&sql)
        .bind(instance_id)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

pub async fn delete_object_refs<'e>(exec: impl PgExecutor<'e>, instance_ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM workflow_object_refs WHERE workflow_instance_id = ANY($1)")
        .bind(instance_ids)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
