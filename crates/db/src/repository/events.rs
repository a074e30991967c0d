//! Workflow event log.
//!
//! The reconciler claims `EMIT_FAILED` rows with `FOR UPDATE SKIP LOCKED`
//! and a lease column, so several reconcilers can poll safely.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{EventType, NewWorkflowEvent, WorkflowEventRow};
use crate::DbError;

const COLUMNS: &str = "id, workflow_instance_id, owner_id, event_type, payload, locked_until, created_at, updated_at";

pub async fn create_event<'e>(exec: impl PgExecutor<'e>, new: NewWorkflowEvent) -> Result<WorkflowEventRow, DbError> {
    let row = new.into_row();
    sqlx::query(
        r#"
        INSERT INTO workflow_events (id, workflow_instance_id, owner_id, event_type, payload, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_instance_id)
    .bind(&row.owner_id)
    .bind(row.event_type)
    .bind(&row.payload)
    .bind(row.created_at)
    .execute(exec)
    .await?;

    Ok(row)
}

pub async fn list_events<'e>(exec: impl PgExecutor<'e>, instance_id: Uuid) -> Result<Vec<WorkflowEventRow>, DbError> {
    let sql = format!("SELECT {COLUMNS} FROM workflow_events WHERE workflow_instance_id = $1 ORDER BY created_at ASC");
    let rows = sqlx::query_as::<_, WorkflowEventRow>(&sql)
        .bind(instance_id)
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

/// Lease up to `limit` unclaimed events of `event_type`, oldest first.
pub async fn claim_events<'e>(
    exec: impl PgExecutor<'e>,
    event_type: EventType,
    limit: usize,
    lease: Duration,
) -> Result<Vec<WorkflowEventRow>, DbError> {
    let now = Utc::now();
    let until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let sql = format!(
        r#"
        UPDATE workflow_events SET locked_until = $1, updated_at = $2
        WHERE id IN (
            SELECT id FROM workflow_events
            WHERE event_type = $3 AND (locked_until IS NULL OR locked_until <= $2)
            ORDER BY created_at ASC
            LIMIT $4
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {COLUMNS}
        "#
    );
    let mut rows = sqlx::query_as::<_, WorkflowEventRow>(&sql)
        .bind(until)
        .bind(now)
        .bind(event_type)
        .bind(limit as i64)
        .fetch_all(exec)
        .await?;
    rows.sort_by_key(|e| e.created_at);
    Ok(rows)
}

pub async fn update_event<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    event_type: EventType,
    payload: serde_json::Value,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE workflow_events SET event_type = $1, payload = $2, locked_until = NULL, updated_at = $3 WHERE id = $4",
    )
    .bind(event_type)
    .bind(payload)
    .bind(Utc::now())
    .bind(id)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn delete_events<'e>(exec: impl PgExecutor<'e>, instance_ids: &[Uuid]) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM workflow_events WHERE workflow_instance_id = ANY($1)")
        .bind(instance_ids)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}
