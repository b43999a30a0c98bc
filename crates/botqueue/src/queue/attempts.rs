use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::QueueResult;

/// One execution of a queue item, kept for audit.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ItemAttempt {
    pub id: Uuid,
    pub item_id: Uuid,
    pub attempt_no: i32,
    pub worker_id: String,
    pub status: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i32>,
}

pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    Abandoned,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Abandoned => "abandoned",
        }
    }
}

#[derive(Clone)]
pub struct AttemptsRepo {
    pool: PgPool,
}

impl AttemptsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        item_id: Uuid,
        attempt_no: i32,
        worker_id: &str,
    ) -> QueueResult<ItemAttempt> {
        let mut conn = self.pool.acquire().await?;
        start_in(&mut conn, item_id, attempt_no, worker_id).await
    }

    pub async fn finish_succeeded(&self, attempt_id: Uuid, latency_ms: i32) -> QueueResult<()> {
        self.finish(attempt_id, AttemptStatus::Succeeded, latency_ms, None)
            .await
    }

    pub async fn finish_failed(
        &self,
        attempt_id: Uuid,
        latency_ms: i32,
        error: &str,
    ) -> QueueResult<()> {
        self.finish(attempt_id, AttemptStatus::Failed, latency_ms, Some(error))
            .await
    }

    async fn finish(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        latency_ms: i32,
        error: Option<&str>,
    ) -> QueueResult<()> {
        // only a running attempt is closed; the reaper may have abandoned it already
        sqlx::query(
            r#"
            UPDATE item_attempts
            SET status = $2,
                finished_at = now(),
                latency_ms = $3,
                error = $4
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(latency_ms)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_item(&self, item_id: Uuid) -> QueueResult<Vec<ItemAttempt>> {
        let rows = sqlx::query_as::<_, ItemAttempt>(
            r#"
            SELECT *
            FROM item_attempts
            WHERE item_id = $1
            ORDER BY attempt_no ASC, started_at ASC
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

pub(crate) async fn start_in(
    conn: &mut PgConnection,
    item_id: Uuid,
    attempt_no: i32,
    worker_id: &str,
) -> QueueResult<ItemAttempt> {
    let attempt = sqlx::query_as::<_, ItemAttempt>(
        r#"
        INSERT INTO item_attempts (item_id, attempt_no, worker_id, status)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(item_id)
    .bind(attempt_no)
    .bind(worker_id)
    .bind(AttemptStatus::Running.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(attempt)
}

/// Close any still-running attempt of `item_id` as abandoned. Runs inside the reaper's transaction.
pub(crate) async fn abandon_open(
    conn: &mut PgConnection,
    item_id: Uuid,
    reason: &str,
) -> QueueResult<u64> {
    let res = sqlx::query(
        r#"
        UPDATE item_attempts
        SET status = $2,
            finished_at = now(),
            latency_ms = (EXTRACT(EPOCH FROM (now() - started_at)) * 1000)::int,
            error = $3
        WHERE item_id = $1
          AND status = 'running'
        "#,
    )
    .bind(item_id)
    .bind(AttemptStatus::Abandoned.as_str())
    .bind(reason)
    .execute(&mut *conn)
    .await?;

    Ok(res.rows_affected())
}
