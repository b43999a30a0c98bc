// crates/botqueue/src/queue/store.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::queue::attempts::{self, ItemAttempt};
use crate::queue::model::{ItemStatus, NewItem, Priority, QueueItem};
use crate::queue::retry::{Decision, RetryPolicy};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Rows the reaper locks per sweep.
const REAP_BATCH: i64 = 100;

#[derive(Clone)]
pub struct ItemStore {
    pool: PgPool,
    max_payload_bytes: usize,
}

/// Filter for the administrative listing. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<ItemStatus>,
    pub priority: Option<Priority>,
    pub correlation_id: Option<Uuid>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
    /// `(created_at, id)` of the last row of the previous page.
    pub cursor: Option<(DateTime<Utc>, Uuid)>,
}

impl ItemFilter {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn correlation(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: ItemStatus,
    pub count: i64,
}

/// An item the reaper took back from a worker presumed dead.
#[derive(Debug, Clone)]
pub struct ReapedItem {
    pub stale_worker: Option<String>,
    pub decision: Decision,
    pub item: QueueItem,
}

impl ItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    pub async fn enqueue(&self, item: NewItem) -> QueueResult<Uuid> {
        item.validate(self.max_payload_bytes)?;

        let mut tx = self.pool.begin().await?;

        // parent must already exist; a child without its own correlation id joins the parent's workflow
        let mut correlation_id = item.correlation_id;
        if let Some(parent_id) = item.parent_id {
            let parent_correlation = sqlx::query_scalar::<_, Option<Uuid>>(
                "SELECT correlation_id FROM queue_items WHERE id = $1",
            )
            .bind(parent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::Validation(format!("parent item {parent_id} does not exist")))?;

            correlation_id = correlation_id.or(parent_correlation);
        }

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO queue_items (
                priority, status, task_type, user_id, channel_id, payload,
                max_attempts, scheduled_for, correlation_id, parent_id
            )
            VALUES (
                $1, 'queued', $2, $3, $4, $5,
                $6, GREATEST(COALESCE($7, now()), now()), $8, $9
            )
            RETURNING id
            "#,
        )
        .bind(item.priority.value())
        .bind(&item.task_type)
        .bind(&item.user_id)
        .bind(&item.channel_id)
        .bind(&item.payload)
        .bind(item.max_attempts)
        .bind(item.scheduled_for)
        .bind(correlation_id)
        .bind(item.parent_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            item_id = %id,
            task_type = %item.task_type,
            priority = %item.priority,
            "enqueued"
        );
        Ok(id)
    }

    // ----------------------------
    // Claim
    // ----------------------------

    /// Claim the best eligible item for `worker_id`, or `None` if nothing is due.
    ///
    /// The candidate is locked with `FOR UPDATE SKIP LOCKED`, so concurrent
    /// claimants each walk past rows another transaction is holding and end up
    /// with disjoint items. Select and update commit together.
    pub async fn claim_next(&self, worker_id: &str) -> QueueResult<Option<QueueItem>> {
        let mut tx = self.pool.begin().await?;
        let claimed = claim_in(&mut *tx, worker_id).await?;
        tx.commit().await?;

        if let Some(item) = &claimed {
            log_claim(item, worker_id);
        }
        Ok(claimed)
    }

    /// Like [`claim_next`](Self::claim_next), but the attempt row is written in
    /// the same transaction. If either insert fails the claim is rolled back
    /// and the item stays QUEUED.
    pub async fn claim_with_attempt(
        &self,
        worker_id: &str,
    ) -> QueueResult<Option<(QueueItem, ItemAttempt)>> {
        let mut tx = self.pool.begin().await?;

        let Some(item) = claim_in(&mut *tx, worker_id).await? else {
            tx.commit().await?;
            return Ok(None);
        };
        let attempt =
            attempts::start_in(&mut *tx, item.id, item.current_attempt(), worker_id).await?;

        tx.commit().await?;

        log_claim(&item, worker_id);
        Ok(Some((item, attempt)))
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// IN_PROGRESS (held by `worker_id`) -> COMPLETED. `worker_id` stays for audit.
    pub async fn complete(&self, id: Uuid, worker_id: &str) -> QueueResult<QueueItem> {
        let done = sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items
            SET status = 'completed',
                completed_at = now(),
                last_error = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'in_progress'
              AND worker_id = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match done {
            Some(item) => Ok(item),
            None => Err(self.state_error(id, &format!("in_progress held by {worker_id}")).await),
        }
    }

    /// IN_PROGRESS (held by `worker_id`) -> QUEUED, due again after `delay`.
    pub async fn requeue(
        &self,
        id: Uuid,
        worker_id: &str,
        delay: Duration,
        error: &str,
    ) -> QueueResult<QueueItem> {
        let mut conn = self.pool.acquire().await?;
        match requeue_in(&mut conn, id, worker_id, delay, error).await? {
            Some(item) => Ok(item),
            None => Err(self
                .state_error(id, &format!("in_progress held by {worker_id} with retries left"))
                .await),
        }
    }

    /// Quarantine an item.
    ///
    /// With `holder = Some(worker)` the item must be IN_PROGRESS under that
    /// worker and the failed execution is counted. With `None` only a QUEUED
    /// item can be dead-lettered (operator action).
    pub async fn dead_letter(
        &self,
        id: Uuid,
        holder: Option<&str>,
        error: &str,
    ) -> QueueResult<QueueItem> {
        let mut conn = self.pool.acquire().await?;
        match dead_letter_in(&mut conn, id, holder, error).await? {
            Some(item) => Ok(item),
            None => {
                let expected = match holder {
                    Some(w) => format!("in_progress held by {w}"),
                    None => "queued".to_string(),
                };
                Err(self.state_error(id, &expected).await)
            }
        }
    }

    /// Take back items whose claimant has been silent for longer than `timeout`.
    ///
    /// Each one goes through `policy` exactly like a recoverable failure. Rows
    /// are locked for the whole sweep, so a worker finishing late blocks until
    /// the sweep commits and then fails its conditional update.
    pub async fn reap_stale(
        &self,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> QueueResult<Vec<ReapedItem>> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM queue_items
            WHERE status = 'in_progress'
              AND started_at < now() - ($1::bigint * interval '1 millisecond')
            ORDER BY started_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(timeout_ms)
        .bind(REAP_BATCH)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(stale.len());
        for item in stale {
            let Some(worker) = item.worker_id.clone() else {
                warn!(item_id = %item.id, "in_progress item without a worker_id; skipping");
                continue;
            };
            let reason = format!(
                "worker {worker} presumed crashed: no result within {}s",
                timeout.as_secs()
            );

            attempts::abandon_open(&mut *tx, item.id, &reason).await?;

            let decision = policy.decide(item.attempt_count, item.max_attempts);
            let updated = match decision {
                Decision::Requeue(delay) => {
                    requeue_in(&mut *tx, item.id, &worker, delay, &reason).await?
                }
                Decision::DeadLetter => {
                    dead_letter_in(&mut *tx, item.id, Some(&worker), &reason).await?
                }
            };

            if let Some(updated) = updated {
                reaped.push(ReapedItem {
                    stale_worker: Some(worker),
                    decision,
                    item: updated,
                });
            }
        }

        tx.commit().await?;

        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale items");
        }
        Ok(reaped)
    }

    // ----------------------------
    // Reads (admin)
    // ----------------------------

    pub async fn get(&self, id: Uuid) -> QueueResult<Option<QueueItem>> {
        let item = sqlx::query_as::<_, QueueItem>("SELECT * FROM queue_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// Newest first, cursor-paginated on `(created_at, id)`. Limit clamps to [1, 500].
    pub async fn list(&self, filter: &ItemFilter) -> QueueResult<Vec<QueueItem>> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 500);
        let (cursor_created_at, cursor_id) = match filter.cursor {
            Some((at, id)) => (Some(at), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM queue_items
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::int IS NULL OR priority = $2)
              AND ($3::uuid IS NULL OR correlation_id = $3)
              AND ($4::text IS NULL OR task_type = $4)
              AND ($5::timestamptz IS NULL OR (created_at, id) < ($5::timestamptz, $6::uuid))
            ORDER BY created_at DESC, id DESC
            LIMIT $7
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.priority.map(Priority::value))
        .bind(filter.correlation_id)
        .bind(filter.task_type.as_deref())
        .bind(cursor_created_at)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn dead_letters(&self, limit: i64) -> QueueResult<Vec<QueueItem>> {
        self.list(&ItemFilter {
            status: Some(ItemStatus::DeadLetter),
            limit: Some(limit),
            ..ItemFilter::default()
        })
        .await
    }

    /// Every item of one workflow, in creation order.
    pub async fn by_correlation(&self, correlation_id: Uuid) -> QueueResult<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM queue_items
            WHERE correlation_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn children_of(&self, parent_id: Uuid) -> QueueResult<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT *
            FROM queue_items
            WHERE parent_id = $1
            ORDER BY created_at ASC, seq ASC
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn status_counts(&self) -> QueueResult<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM queue_items GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count)| -> QueueResult<StatusCount> {
                Ok(StatusCount {
                    status: status.parse()?,
                    count,
                })
            })
            .collect()
    }

    // ----------------------------
    // Replay
    // ----------------------------

    /// Re-run a dead-lettered item as a fresh QUEUED copy. The original stays terminal.
    pub async fn replay(
        &self,
        id: Uuid,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> QueueResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        let src = sqlx::query_as::<_, QueueItem>(
            "SELECT * FROM queue_items WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NotFound(id))?;

        if src.status != ItemStatus::DeadLetter {
            return Err(QueueError::State {
                id,
                expected: ItemStatus::DeadLetter.to_string(),
                found: src.status.to_string(),
            });
        }

        let new_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO queue_items (
                priority, status, task_type, user_id, channel_id, payload,
                max_attempts, scheduled_for, correlation_id, parent_id, replay_of
            )
            VALUES (
                $1, 'queued', $2, $3, $4, $5,
                $6, GREATEST(COALESCE($7, now()), now()), $8, $9, $10
            )
            RETURNING id
            "#,
        )
        .bind(src.priority.value())
        .bind(&src.task_type)
        .bind(&src.user_id)
        .bind(&src.channel_id)
        .bind(&src.payload)
        .bind(src.max_attempts)
        .bind(scheduled_for)
        .bind(src.correlation_id)
        .bind(src.parent_id)
        .bind(src.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(item_id = %new_id, replay_of = %id, "replayed dead-lettered item");
        Ok(new_id)
    }

    async fn state_error(&self, id: Uuid, expected: &str) -> QueueError {
        let found = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT status, worker_id FROM queue_items WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match found {
            Ok(Some((status, worker))) => QueueError::State {
                id,
                expected: expected.to_string(),
                found: match worker {
                    Some(w) => format!("{status} (worker {w})"),
                    None => status,
                },
            },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => e.into(),
        }
    }
}

/// Lock the best due item and mark it IN_PROGRESS for `worker_id`.
async fn claim_in(conn: &mut PgConnection, worker_id: &str) -> QueueResult<Option<QueueItem>> {
    let candidate: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM queue_items
        WHERE status = 'queued'
          AND scheduled_for <= now()
        ORDER BY priority DESC, scheduled_for ASC, created_at ASC, seq ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    let claimed = sqlx::query_as::<_, QueueItem>(
        r#"
        UPDATE queue_items
        SET status = 'in_progress',
            worker_id = $2,
            started_at = now(),
            completed_at = NULL,
            updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(worker_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Some(claimed))
}

fn log_claim(item: &QueueItem, worker_id: &str) {
    debug!(
        item_id = %item.id,
        task_type = %item.task_type,
        worker_id,
        attempt = item.current_attempt(),
        "claimed"
    );
}

/// Conditional requeue. `None` when the item is no longer held by `worker_id`
/// or has no retries left.
async fn requeue_in(
    conn: &mut PgConnection,
    id: Uuid,
    worker_id: &str,
    delay: Duration,
    error: &str,
) -> QueueResult<Option<QueueItem>> {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

    let item = sqlx::query_as::<_, QueueItem>(
        r#"
        UPDATE queue_items
        SET status = 'queued',
            attempt_count = attempt_count + 1,
            scheduled_for = now() + ($3::bigint * interval '1 millisecond'),
            worker_id = NULL,
            last_error = $4,
            updated_at = now()
        WHERE id = $1
          AND status = 'in_progress'
          AND worker_id = $2
          AND attempt_count + 1 < max_attempts
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(worker_id)
    .bind(delay_ms)
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(item)
}

/// Conditional dead-letter. A held item has its failed execution counted,
/// capped at `max_attempts`.
async fn dead_letter_in(
    conn: &mut PgConnection,
    id: Uuid,
    holder: Option<&str>,
    error: &str,
) -> QueueResult<Option<QueueItem>> {
    let item = sqlx::query_as::<_, QueueItem>(
        r#"
        UPDATE queue_items
        SET status = 'dead_letter',
            attempt_count = CASE
                WHEN status = 'in_progress' THEN LEAST(attempt_count + 1, max_attempts)
                ELSE attempt_count
            END,
            last_error = $3,
            updated_at = now()
        WHERE id = $1
          AND (
                (status = 'in_progress' AND worker_id = $2::text)
             OR (status = 'queued' AND $2::text IS NULL)
          )
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(holder)
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(item)
}
