//! Postgres-backed runtime.
//!
//! Events land in `workflow_event_queue`. The idempotency key is unique, so a
//! replayed emit is acknowledged without a second row. Consumers poll with
//! `SELECT … FOR UPDATE SKIP LOCKED` and either complete or fail the row;
//! rows that exhaust `max_attempts` are dead-lettered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Consumer, Delivery, Envelope, Headers, QueueError, Receipt, Runtime};

/// A row of `workflow_event_queue`.
#[derive(Debug, Clone, FromRow)]
pub struct QueuedEventRow {
    pub id: Uuid,
    pub topic: String,
    pub idempotency_key: String,
    pub headers: Value,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, topic, idempotency_key, headers, payload, status, attempts, max_attempts, \
                       last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRuntime {
    pool: PgPool,
    max_attempts: i32,
}

impl PgRuntime {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, max_attempts: 3 }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Atomically take the oldest pending event of `topic` and mark it
    /// `processing`. Returns `None` if nothing is pending.
    pub async fn fetch_next(&self, topic: &str) -> Result<Option<QueuedEventRow>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM workflow_event_queue
            WHERE status = 'pending' AND topic = $1
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query_as::<_, QueuedEventRow>(&sql)
            .bind(topic)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(ref event) = row {
            sqlx::query(
                "UPDATE workflow_event_queue SET status = 'processing', attempts = attempts + 1, updated_at = $1 WHERE id = $2",
            )
            .bind(Utc::now())
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }

        Ok(row)
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("UPDATE workflow_event_queue SET status = 'completed', updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Return the row to `pending`, or dead-letter it once attempts are exhausted.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let (attempts, max_attempts): (i32, i32) =
            sqlx::query_as("SELECT attempts, max_attempts FROM workflow_event_queue WHERE id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        let status = if attempts >= max_attempts { "dead_lettered" } else { "pending" };
        if status == "dead_lettered" {
            warn!(%id, attempts, "queued event dead-lettered");
        }

        sqlx::query("UPDATE workflow_event_queue SET status = $1, last_error = $2, updated_at = $3 WHERE id = $4")
            .bind(status)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Runtime for PgRuntime {
    async fn emit_with_headers(&self, topic: &str, payload: Value, headers: Headers) -> Result<Receipt, QueueError> {
        let header_json = serde_json::to_value(&headers).map_err(|e| QueueError::Encode(e.to_string()))?;
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO workflow_event_queue
                (id, topic, idempotency_key, headers, payload, status, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(topic)
        .bind(&headers.idempotency_key)
        .bind(header_json)
        .bind(payload)
        .bind(self.max_attempts)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if inserted.is_some() {
            info!(topic, event_id = %headers.event_id, "event enqueued");
        }
        Ok(Receipt {
            event_id: headers.event_id,
            enqueued: inserted.is_some(),
        })
    }
}

#[async_trait]
impl Consumer for PgRuntime {
    async fn claim(&self, topic: &str) -> Result<Option<Delivery>, QueueError> {
        let Some(row) = self.fetch_next(topic).await? else {
            return Ok(None);
        };
        let headers: Headers = serde_json::from_value(row.headers.clone()).unwrap_or_else(|_| {
            Headers::new(row.id.to_string(), row.idempotency_key.clone())
        });
        Ok(Some(Delivery {
            id: row.id.to_string(),
            attempts: (row.attempts + 1).max(1) as u32,
            envelope: Envelope {
                topic: row.topic,
                headers,
                payload: row.payload,
            },
        }))
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError> {
        self.complete(parse_id(delivery_id)?).await
    }

    async fn nack(&self, delivery_id: &str, error: &str) -> Result<(), QueueError> {
        self.fail(parse_id(delivery_id)?, error).await
    }
}

fn parse_id(delivery_id: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(delivery_id).map_err(|e| QueueError::Storage(format!("invalid delivery id '{delivery_id}': {e}")))
}

