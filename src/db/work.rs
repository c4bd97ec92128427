//! Postgres queue store: enqueue, skip-locked claiming, outcome reconciliation.
//!
//! A batch is one transaction. `claim_batch` locks due rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent dispatchers each get a disjoint
//! set without waiting on each other. Outcomes are plain UPDATEs on the same
//! transaction and become visible only on commit; if the commit fails, every
//! claimed row is simply due again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Error, Result};
use crate::model::work::{NewWorkItem, Status, WorkFilter, WorkId, WorkItem};
use crate::queue::{ClaimedBatch, QueueStore};
use crate::telemetry::metrics;

const DEFAULT_LIST_LIMIT: i64 = 100;

/// [`QueueStore`] over the `work_queue` table.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    max_retries: u32,
}

impl PgQueueStore {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    fn max_retries_param(&self) -> i32 {
        i32::try_from(self.max_retries).unwrap_or(i32::MAX)
    }

    /// Enqueue inside the caller's transaction, so the business rows and the
    /// work item that announces them commit or roll back together.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: NewWorkItem,
    ) -> Result<WorkId> {
        enqueue_on(&mut **tx, &new).await
    }
}

async fn enqueue_on<'e, E>(executor: E, new: &NewWorkItem) -> Result<WorkId>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO work_queue (work_type, payload, next_attempt_at, created_at)
         VALUES ($1, $2, $3, $4)
         RETURNING id",
    )
    .bind(&new.work_type)
    .bind(&new.payload)
    .bind(new.next_attempt_at)
    .bind(new.created_at)
    .fetch_one(executor)
    .await?;

    metrics::work_enqueued().add(1, &[KeyValue::new("work_type", new.work_type.clone())]);
    Ok(WorkId(id))
}

#[async_trait]
impl QueueStore for PgQueueStore {
    type Batch = PgBatch;

    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId> {
        enqueue_on(&self.pool, &new).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<PgBatch> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("cannot begin claim transaction: {e}")))?;

        // Transaction start time: every outcome in this batch uses it as "now".
        let claimed_at: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&mut *tx)
            .await?;

        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT id, work_type, payload, attempt_count, last_attempt_at, next_attempt_at,
                    created_at, completed_at, dead_lettered_at, last_error
             FROM work_queue
             WHERE completed_at IS NULL
               AND dead_lettered_at IS NULL
               AND next_attempt_at <= $1
               AND attempt_count < $2
             ORDER BY next_attempt_at ASC, id ASC
             LIMIT $3
             FOR UPDATE SKIP LOCKED",
        )
        .bind(claimed_at)
        .bind(self.max_retries_param())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        let items: Vec<WorkItem> = rows.into_iter().map(WorkItem::from).collect();
        if !items.is_empty() {
            metrics::work_claimed().add(items.len() as u64, &[]);
        }

        Ok(PgBatch {
            tx,
            items,
            claimed_at,
            max_retries: self.max_retries_param(),
        })
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(
            "SELECT id, work_type, payload, attempt_count, last_attempt_at, next_attempt_at,
                    created_at, completed_at, dead_lettered_at, last_error
             FROM work_queue WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::from)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT id, work_type, payload, attempt_count, last_attempt_at, next_attempt_at,
                    created_at, completed_at, dead_lettered_at, last_error
             FROM work_queue
             WHERE ($1::text IS NULL OR work_type = $1)
               AND ($2::text IS NULL
                    OR ($2 = 'completed' AND completed_at IS NOT NULL)
                    OR ($2 = 'dead_lettered' AND completed_at IS NULL
                        AND (dead_lettered_at IS NOT NULL OR attempt_count >= $3))
                    OR ($2 = 'pending' AND completed_at IS NULL
                        AND dead_lettered_at IS NULL AND attempt_count < $3))
             ORDER BY id DESC
             LIMIT $4",
        )
        .bind(filter.work_type.as_deref())
        .bind(filter.status.map(|s| s.to_string()))
        .bind(self.max_retries_param())
        .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WorkItem::from).collect())
    }

    async fn complete(&self, id: WorkId) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM work_queue WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Err(Error::NotFound(format!("work item {id}")));
        }

        complete_on(&mut *tx, id, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn counts(&self) -> Result<Vec<(Status, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT CASE
                        WHEN completed_at IS NOT NULL THEN 'completed'
                        WHEN dead_lettered_at IS NOT NULL OR attempt_count >= $1 THEN 'dead_lettered'
                        ELSE 'pending'
                    END AS status,
                    COUNT(*)
             FROM work_queue
             GROUP BY 1
             ORDER BY 1",
        )
        .bind(self.max_retries_param())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, n)| Ok((status.parse()?, n)))
            .collect()
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

async fn complete_on<'e, E>(executor: E, id: WorkId, now: DateTime<Utc>) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    // completed_at IS NULL makes a second completion a no-op.
    sqlx::query(
        "UPDATE work_queue
         SET completed_at = $1, last_attempt_at = $1, next_attempt_at = NULL
         WHERE id = $2 AND completed_at IS NULL",
    )
    .bind(now)
    .bind(id.0)
    .execute(executor)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A claim transaction over the `work_queue` table. Dropping it without
/// `commit` rolls back and releases the row locks.
pub struct PgBatch {
    tx: Transaction<'static, Postgres>,
    items: Vec<WorkItem>,
    claimed_at: DateTime<Utc>,
    max_retries: i32,
}

#[async_trait]
impl ClaimedBatch for PgBatch {
    fn items(&self) -> &[WorkItem] {
        &self.items
    }

    fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    async fn complete(&mut self, id: WorkId) -> Result<()> {
        complete_on(&mut *self.tx, id, self.claimed_at).await
    }

    async fn reschedule(
        &mut self,
        id: WorkId,
        next_attempt_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE work_queue
             SET attempt_count = attempt_count + 1,
                 last_attempt_at = $1,
                 last_error = $3,
                 next_attempt_at = CASE
                     WHEN attempt_count + 1 >= $4 THEN NULL
                     ELSE GREATEST(next_attempt_at, $2)
                 END,
                 dead_lettered_at = CASE
                     WHEN attempt_count + 1 >= $4 THEN $1
                     ELSE NULL
                 END
             WHERE id = $5 AND completed_at IS NULL AND dead_lettered_at IS NULL",
        )
        .bind(self.claimed_at)
        .bind(next_attempt_at)
        .bind(reason)
        .bind(self.max_retries)
        .bind(id.0)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, id: WorkId, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE work_queue
             SET attempt_count = attempt_count + 1,
                 last_attempt_at = $1,
                 last_error = $2,
                 next_attempt_at = NULL,
                 dead_lettered_at = $1
             WHERE id = $3 AND completed_at IS NULL AND dead_lettered_at IS NULL",
        )
        .bind(self.claimed_at)
        .bind(reason)
        .bind(id.0)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: i64,
    work_type: String,
    payload: Vec<u8>,
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    dead_lettered_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            id: WorkId(row.id),
            work_type: row.work_type,
            payload: row.payload,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
            dead_lettered_at: row.dead_lettered_at,
            last_error: row.last_error,
        }
    }
}
