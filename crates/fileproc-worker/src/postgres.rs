use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use crate::broker::{
    compute_retry_backoff_seconds, AckToken, BrokerError, Delivery, EnqueueRequest, FailOutcome,
    QueueBroker, TaskHandle, MAX_RETRY_BACKOFF_SECS, VISIBILITY_GRACE,
};

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    kind: String,
    payload: Vec<u8>,
    retry_count: i32,
    max_retry: i32,
    timeout_seconds: i32,
}

#[derive(sqlx::FromRow)]
struct FailedRow {
    status: String,
    retry_count: i32,
}

fn to_i32(value: u64, field: &str) -> Result<i32, BrokerError> {
    i32::try_from(value)
        .map_err(|_| BrokerError::Rejected(format!("{} out of range: {}", field, value)))
}

/// Durable broker backed by the `tasks` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
/// same table. A claim stays valid until `claimed_until`, i.e. the task timeout
/// plus [`VISIBILITY_GRACE`].
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn outcome(row: FailedRow) -> FailOutcome {
        if row.status == "dead" {
            FailOutcome::DeadLettered
        } else {
            let retry_count = row.retry_count.max(0) as u32;
            // Mirrors the delay computed in SQL from the previous count.
            let delay = compute_retry_backoff_seconds(retry_count.saturating_sub(1));
            FailOutcome::Retrying {
                retry_count,
                delay: Duration::from_secs(delay),
            }
        }
    }
}

#[async_trait]
impl QueueBroker for PgTaskQueue {
    #[tracing::instrument(skip(self, request), fields(db.table = "tasks", db.operation = "insert", task.kind = %request.kind))]
    async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskHandle, BrokerError> {
        let max_retry = to_i32(u64::from(request.max_retry), "max_retry")?;
        let timeout_seconds = to_i32(request.timeout.as_secs(), "timeout")?;
        if timeout_seconds == 0 {
            return Err(BrokerError::Rejected("timeout must be at least one second".to_string()));
        }

        let id: Uuid = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            INSERT INTO tasks (kind, payload, max_retry, timeout_seconds)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&request.kind)
        .bind(&request.payload)
        .bind(max_retry)
        .bind(timeout_seconds)
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskHandle {
            id,
            kind: request.kind,
        })
    }

    #[tracing::instrument(skip(self), fields(db.table = "tasks", db.operation = "claim"))]
    async fn dequeue(&self) -> Result<Option<Delivery>, BrokerError> {
        let claim = Uuid::new_v4();

        let row: Option<ClaimedRow> = sqlx::query_as::<Postgres, ClaimedRow>(
            r#"
            UPDATE tasks
            SET status = 'running',
                claim_token = $1,
                claimed_until = NOW() + (timeout_seconds + $2) * INTERVAL '1 second',
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM tasks
                WHERE status = 'pending'
                    AND run_at <= NOW()
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, payload, retry_count, max_retry, timeout_seconds
            "#,
        )
        .bind(claim)
        .bind(VISIBILITY_GRACE.as_secs() as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            tracing::debug!(task.id = %row.id, task.kind = %row.kind, "Task claimed");
            Delivery {
                kind: row.kind,
                payload: row.payload,
                token: AckToken {
                    task_id: row.id,
                    claim,
                },
                retry_count: row.retry_count.max(0) as u32,
                max_retry: row.max_retry.max(0) as u32,
                timeout: Duration::from_secs(row.timeout_seconds.max(0) as u64),
            }
        }))
    }

    #[tracing::instrument(skip(self), fields(db.table = "tasks", db.operation = "update", task.id = %token.task_id))]
    async fn ack(&self, token: &AckToken) -> Result<(), BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed',
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(token.task_id)
        .bind(token.claim)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleClaim(token.task_id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, reason), fields(db.table = "tasks", db.operation = "update", task.id = %token.task_id))]
    async fn fail(&self, token: &AckToken, reason: &str) -> Result<FailOutcome, BrokerError> {
        let row: Option<FailedRow> = sqlx::query_as::<Postgres, FailedRow>(
            r#"
            UPDATE tasks
            SET status = CASE WHEN retry_count < max_retry THEN 'pending' ELSE 'dead' END,
                run_at = CASE
                    WHEN retry_count < max_retry
                        THEN NOW() + LEAST(POWER(2, retry_count), $3) * INTERVAL '1 second'
                    ELSE run_at
                END,
                retry_count = CASE WHEN retry_count < max_retry THEN retry_count + 1 ELSE retry_count END,
                last_error = $4,
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            RETURNING status, retry_count
            "#,
        )
        .bind(token.task_id)
        .bind(token.claim)
        .bind(MAX_RETRY_BACKOFF_SECS as f64)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(BrokerError::StaleClaim(token.task_id))?;
        Ok(Self::outcome(row))
    }

    #[tracing::instrument(skip(self, reason), fields(db.table = "tasks", db.operation = "update", task.id = %token.task_id))]
    async fn dead_letter(&self, token: &AckToken, reason: &str) -> Result<(), BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'dead',
                last_error = $3,
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND claim_token = $2
            "#,
        )
        .bind(token.task_id)
        .bind(token.claim)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleClaim(token.task_id));
        }
        tracing::warn!(task.id = %token.task_id, reason = %reason, "Task dead-lettered");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "tasks", db.operation = "update"))]
    async fn requeue_expired(&self) -> Result<u64, BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = CASE WHEN retry_count < max_retry THEN 'pending' ELSE 'dead' END,
                run_at = CASE
                    WHEN retry_count < max_retry
                        THEN NOW() + LEAST(POWER(2, retry_count), $1) * INTERVAL '1 second'
                    ELSE run_at
                END,
                retry_count = CASE WHEN retry_count < max_retry THEN retry_count + 1 ELSE retry_count END,
                last_error = 'visibility timeout expired',
                claim_token = NULL,
                claimed_until = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND claimed_until < NOW()
            "#,
        )
        .bind(MAX_RETRY_BACKOFF_SECS as f64)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count = count, "Re-queued tasks with lapsed claims");
        }
        Ok(count)
    }
}
