//! Queue store abstraction: enqueue, claim a batch, reconcile outcomes.
//!
//! A [`ClaimedBatch`] is one transaction. Items it returns are locked
//! against every other batch until it commits or rolls back, and none of
//! the outcomes recorded on it become visible before commit. Dropping a
//! batch without committing rolls it back, so a crash mid-batch leaves
//! every claimed item eligible again.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::work::{NewWorkItem, Status, WorkFilter, WorkId, WorkItem};

pub use memory::MemoryQueueStore;

/// Persistent home of the work queue.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    type Batch: ClaimedBatch;

    /// Append a work item. Returns its assigned ID.
    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId>;

    /// Claim up to `limit` eligible items, oldest-due first.
    ///
    /// Rows locked by another batch are skipped, never waited on. Fails with
    /// [`Error::StoreUnavailable`](crate::error::Error::StoreUnavailable) if
    /// the transaction cannot begin.
    async fn claim_batch(&self, limit: usize) -> Result<Self::Batch>;

    /// Fetch one item for inspection.
    async fn get(&self, id: WorkId) -> Result<WorkItem>;

    /// List items, newest first.
    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>>;

    /// Mark an item completed outside a batch (operator resolution).
    /// Idempotent. Waits for any batch currently holding the row.
    async fn complete(&self, id: WorkId) -> Result<()>;

    /// Number of items per derived status.
    async fn counts(&self) -> Result<Vec<(Status, i64)>>;

    /// Retry budget this store applies when deciding eligibility.
    fn max_retries(&self) -> u32;
}

/// A claimed batch: the claimed items plus the transaction that holds them.
#[async_trait]
pub trait ClaimedBatch: Send {
    /// Claimed items ordered by `next_attempt_at` ascending.
    fn items(&self) -> &[WorkItem];

    /// Store time at which the batch was claimed. Used as "now" for every
    /// outcome recorded on the batch.
    fn claimed_at(&self) -> DateTime<Utc>;

    /// Mark done. Completing an already-completed item is a no-op.
    async fn complete(&mut self, id: WorkId) -> Result<()>;

    /// Record a failed attempt and push the item back to `next_attempt_at`
    /// (never earlier than its current value). Dead-letters the item if this
    /// attempt reaches the retry budget.
    async fn reschedule(
        &mut self,
        id: WorkId,
        next_attempt_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<()>;

    /// Record a failed attempt and retire the item permanently.
    async fn dead_letter(&mut self, id: WorkId, reason: &str) -> Result<()>;

    /// Make every recorded outcome durable and release the claims.
    async fn commit(self) -> Result<()>;

    /// Discard every recorded outcome and release the claims.
    async fn rollback(self) -> Result<()>;
}
