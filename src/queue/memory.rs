//! In-process queue store.
//!
//! Mirrors the Postgres claiming protocol with a lock set: a batch claims
//! rows by inserting their IDs into the set under one mutex acquisition, and
//! other batches filter locked IDs out instead of waiting. Outcomes are
//! staged on the batch and applied only on commit.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{ClaimedBatch, QueueStore};
use crate::error::{Error, Result};
use crate::model::work::{NewWorkItem, Status, WorkFilter, WorkId, WorkItem};

#[derive(Default)]
struct State {
    rows: BTreeMap<WorkId, WorkItem>,
    locked: HashSet<WorkId>,
    next_id: i64,
    clock_offset: Duration,
    fail_next_commit: bool,
    unavailable: bool,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

/// In-memory [`QueueStore`]. Cloning shares the same queue.
#[derive(Clone)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
    max_retries: u32,
}

impl MemoryQueueStore {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            max_retries,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        lock_state(&self.state)
    }

    /// Shift the store's clock forward. Lets tests reach `next_attempt_at`
    /// without sleeping.
    pub fn advance(&self, by: Duration) -> Result<()> {
        let mut state = self.lock()?;
        state.clock_offset += by;
        Ok(())
    }

    /// The store's current time.
    pub fn now(&self) -> Result<DateTime<Utc>> {
        Ok(self.lock()?.now())
    }

    /// Make the next batch commit fail as if the connection dropped.
    pub fn fail_next_commit(&self) -> Result<()> {
        self.lock()?.fail_next_commit = true;
        Ok(())
    }

    /// Simulate the store being unreachable: `claim_batch` fails.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// Whether some open batch currently holds a claim on `id`.
    pub fn is_claimed(&self, id: WorkId) -> Result<bool> {
        Ok(self.lock()?.locked.contains(&id))
    }
}

fn lock_state(state: &Mutex<State>) -> Result<MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|_| Error::Other("memory queue state poisoned".to_string()))
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    type Batch = MemoryBatch;

    async fn enqueue(&self, new: NewWorkItem) -> Result<WorkId> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = WorkId(state.next_id);
        state.rows.insert(
            id,
            WorkItem {
                id,
                work_type: new.work_type,
                payload: new.payload,
                attempt_count: 0,
                last_attempt_at: None,
                next_attempt_at: Some(new.next_attempt_at),
                created_at: new.created_at,
                completed_at: None,
                dead_lettered_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<MemoryBatch> {
        let mut state = self.lock()?;
        if state.unavailable {
            return Err(Error::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }

        let now = state.now();
        let mut due: Vec<WorkItem> = state
            .rows
            .values()
            .filter(|item| !state.locked.contains(&item.id))
            .filter(|item| item.is_claimable(now, self.max_retries))
            .cloned()
            .collect();
        due.sort_by_key(|item| (item.next_attempt_at, item.id));
        due.truncate(limit);

        for item in &due {
            state.locked.insert(item.id);
        }

        Ok(MemoryBatch {
            state: Arc::clone(&self.state),
            items: due,
            claimed_at: now,
            max_retries: self.max_retries,
            staged: Vec::new(),
            open: true,
        })
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.lock()?
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }

    async fn list(&self, filter: &WorkFilter) -> Result<Vec<WorkItem>> {
        let state = self.lock()?;
        let limit = filter.limit.map(|n| n.max(0) as usize).unwrap_or(usize::MAX);
        Ok(state
            .rows
            .values()
            .rev()
            .filter(|item| {
                filter
                    .status
                    .is_none_or(|s| item.status(self.max_retries) == s)
            })
            .filter(|item| {
                filter
                    .work_type
                    .as_deref()
                    .is_none_or(|t| item.work_type == t)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn complete(&self, id: WorkId) -> Result<()> {
        let mut state = self.lock()?;
        let now = state.now();
        let item = state
            .rows
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
        apply_complete(item, now);
        Ok(())
    }

    async fn counts(&self) -> Result<Vec<(Status, i64)>> {
        let state = self.lock()?;
        let mut counts = [
            (Status::Pending, 0),
            (Status::Completed, 0),
            (Status::DeadLettered, 0),
        ];
        for item in state.rows.values() {
            let status = item.status(self.max_retries);
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 += 1;
            }
        }
        Ok(counts.to_vec())
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Staged {
    Complete(WorkId),
    Reschedule {
        id: WorkId,
        next_attempt_at: DateTime<Utc>,
        reason: String,
    },
    DeadLetter {
        id: WorkId,
        reason: String,
    },
}

/// Batch over a [`MemoryQueueStore`].
pub struct MemoryBatch {
    state: Arc<Mutex<State>>,
    items: Vec<WorkItem>,
    claimed_at: DateTime<Utc>,
    max_retries: u32,
    staged: Vec<Staged>,
    open: bool,
}

impl MemoryBatch {
    fn stage(&mut self, id: WorkId, op: Staged) -> Result<()> {
        let state = lock_state(&self.state)?;
        if !state.rows.contains_key(&id) {
            return Err(Error::NotFound(format!("work item {id}")));
        }
        drop(state);
        self.staged.push(op);
        Ok(())
    }

    fn release(&mut self, state: &mut State) {
        for item in &self.items {
            state.locked.remove(&item.id);
        }
        self.open = false;
    }
}

#[async_trait]
impl ClaimedBatch for MemoryBatch {
    fn items(&self) -> &[WorkItem] {
        &self.items
    }

    fn claimed_at(&self) -> DateTime<Utc> {
        self.claimed_at
    }

    async fn complete(&mut self, id: WorkId) -> Result<()> {
        self.stage(id, Staged::Complete(id))
    }

    async fn reschedule(
        &mut self,
        id: WorkId,
        next_attempt_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        self.stage(
            id,
            Staged::Reschedule {
                id,
                next_attempt_at,
                reason: reason.to_string(),
            },
        )
    }

    async fn dead_letter(&mut self, id: WorkId, reason: &str) -> Result<()> {
        self.stage(
            id,
            Staged::DeadLetter {
                id,
                reason: reason.to_string(),
            },
        )
    }

    async fn commit(mut self) -> Result<()> {
        let state_handle = Arc::clone(&self.state);
        let mut state = lock_state(&state_handle)?;

        if state.fail_next_commit {
            state.fail_next_commit = false;
            self.release(&mut state);
            return Err(Error::StoreUnavailable(
                "commit failed: connection lost".to_string(),
            ));
        }

        let now = self.claimed_at;
        for op in self.staged.drain(..) {
            let id = match &op {
                Staged::Complete(id) => *id,
                Staged::Reschedule { id, .. } | Staged::DeadLetter { id, .. } => *id,
            };
            let Some(item) = state.rows.get_mut(&id) else {
                continue;
            };
            match op {
                Staged::Complete(_) => apply_complete(item, now),
                Staged::Reschedule {
                    next_attempt_at,
                    reason,
                    ..
                } => apply_reschedule(item, now, next_attempt_at, &reason, self.max_retries),
                Staged::DeadLetter { reason, .. } => apply_dead_letter(item, now, &reason),
            }
        }

        self.release(&mut state);
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        let state_handle = Arc::clone(&self.state);
        let mut state = lock_state(&state_handle)?;
        self.staged.clear();
        self.release(&mut state);
        Ok(())
    }
}

impl Drop for MemoryBatch {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let state_handle = Arc::clone(&self.state);
        if let Ok(mut state) = state_handle.lock() {
            self.release(&mut state);
        }
    }
}

// ---------------------------------------------------------------------------
// Row transitions, shared by batch commits and operator completion.
// ---------------------------------------------------------------------------

fn is_retired(item: &WorkItem) -> bool {
    item.completed_at.is_some() || item.dead_lettered_at.is_some()
}

fn apply_complete(item: &mut WorkItem, now: DateTime<Utc>) {
    if item.completed_at.is_some() {
        return;
    }
    item.completed_at = Some(now);
    item.last_attempt_at = Some(now);
    item.next_attempt_at = None;
}

fn apply_reschedule(
    item: &mut WorkItem,
    now: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    reason: &str,
    max_retries: u32,
) {
    if is_retired(item) {
        return;
    }
    item.attempt_count += 1;
    item.last_attempt_at = Some(now);
    item.last_error = Some(reason.to_string());
    if item.attempt_count >= max_retries {
        item.dead_lettered_at = Some(now);
        item.next_attempt_at = None;
    } else {
        item.next_attempt_at = Some(match item.next_attempt_at {
            Some(current) => current.max(next_attempt_at),
            None => next_attempt_at,
        });
    }
}

fn apply_dead_letter(item: &mut WorkItem, now: DateTime<Utc>, reason: &str) {
    if is_retired(item) {
        return;
    }
    item.attempt_count += 1;
    item.last_attempt_at = Some(now);
    item.last_error = Some(reason.to_string());
    item.dead_lettered_at = Some(now);
    item.next_attempt_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(n: usize) -> MemoryQueueStore {
        let store = MemoryQueueStore::new(3);
        for i in 0..n {
            store
                .enqueue(NewWorkItem::new("echo", format!("{{\"n\":{i}}}")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn overlapping_batches_never_share_items() {
        let store = store_with(5).await;

        let first = store.claim_batch(3).await.unwrap();
        let second = store.claim_batch(3).await.unwrap();

        let a: HashSet<_> = first.items().iter().map(|i| i.id).collect();
        let b: HashSet<_> = second.items().iter().map(|i| i.id).collect();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert!(a.is_disjoint(&b));
    }

    #[tokio::test]
    async fn dropped_batch_releases_claims_without_outcomes() {
        let store = store_with(1).await;

        let mut batch = store.claim_batch(10).await.unwrap();
        let id = batch.items()[0].id;
        batch.complete(id).await.unwrap();
        drop(batch);

        assert!(!store.is_claimed(id).unwrap());
        let item = store.get(id).await.unwrap();
        assert!(item.completed_at.is_none());
        assert_eq!(store.claim_batch(10).await.unwrap().items().len(), 1);
    }

    #[tokio::test]
    async fn completing_twice_keeps_the_first_completion() {
        let store = store_with(1).await;
        let mut batch = store.claim_batch(1).await.unwrap();
        let id = batch.items()[0].id;
        batch.complete(id).await.unwrap();
        batch.commit().await.unwrap();
        let first = store.get(id).await.unwrap();

        store.advance(Duration::seconds(30)).unwrap();
        store.complete(id).await.unwrap();
        let second = store.get(id).await.unwrap();

        assert!(first.completed_at.is_some());
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(second.last_attempt_at, first.last_attempt_at);
        assert_eq!(second.status(3), Status::Completed);
        assert!(matches!(store.complete(WorkId(99)).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn claims_oldest_due_first() {
        let store = MemoryQueueStore::new(3);
        let now = store.now().unwrap();
        let late = store
            .enqueue(NewWorkItem::new("echo", "late").not_before(now - Duration::seconds(1)))
            .await
            .unwrap();
        let early = store
            .enqueue(NewWorkItem::new("echo", "early").not_before(now - Duration::seconds(60)))
            .await
            .unwrap();
        store
            .enqueue(NewWorkItem::new("echo", "future").not_before(now + Duration::hours(1)))
            .await
            .unwrap();

        let batch = store.claim_batch(10).await.unwrap();
        let ids: Vec<_> = batch.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[tokio::test]
    async fn reschedule_never_moves_next_attempt_earlier() {
        let store = store_with(1).await;
        let mut batch = store.claim_batch(1).await.unwrap();
        let id = batch.items()[0].id;
        let at = batch.claimed_at();
        batch
            .reschedule(id, at + Duration::seconds(30), "boom")
            .await
            .unwrap();
        batch
            .reschedule(id, at + Duration::seconds(5), "boom again")
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let item = store.get(id).await.unwrap();
        assert_eq!(item.attempt_count, 2);
        assert_eq!(item.next_attempt_at, Some(at + Duration::seconds(30)));
        assert_eq!(item.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn reschedule_at_budget_dead_letters() {
        let store = MemoryQueueStore::new(1);
        let id = store.enqueue(NewWorkItem::new("echo", "x")).await.unwrap();

        let mut batch = store.claim_batch(1).await.unwrap();
        let at = batch.claimed_at();
        batch
            .reschedule(id, at + Duration::seconds(10), "nope")
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let item = store.get(id).await.unwrap();
        assert_eq!(item.status(1), Status::DeadLettered);
        assert!(item.next_attempt_at.is_none());
        assert!(item.dead_lettered_at.is_some());
    }

    #[tokio::test]
    async fn failed_commit_discards_outcomes() {
        let store = store_with(2).await;
        store.fail_next_commit().unwrap();

        let mut batch = store.claim_batch(10).await.unwrap();
        let ids: Vec<_> = batch.items().iter().map(|i| i.id).collect();
        for id in &ids {
            batch.complete(*id).await.unwrap();
        }
        assert!(batch.commit().await.is_err());

        for id in ids {
            let item = store.get(id).await.unwrap();
            assert_eq!(item.status(3), Status::Pending);
            assert!(!store.is_claimed(id).unwrap());
        }
        assert_eq!(store.claim_batch(10).await.unwrap().items().len(), 2);
    }

    #[tokio::test]
    async fn counts_group_by_derived_status() {
        let store = store_with(3).await;
        let mut batch = store.claim_batch(2).await.unwrap();
        let ids: Vec<_> = batch.items().iter().map(|i| i.id).collect();
        batch.complete(ids[0]).await.unwrap();
        batch.dead_letter(ids[1], "bad payload").await.unwrap();
        batch.commit().await.unwrap();

        let counts = store.counts().await.unwrap();
        assert!(counts.contains(&(Status::Pending, 1)));
        assert!(counts.contains(&(Status::Completed, 1)));
        assert!(counts.contains(&(Status::DeadLettered, 1)));
    }

    #[tokio::test]
    async fn unavailable_store_refuses_claims() {
        let store = store_with(1).await;
        store.set_unavailable(true).unwrap();
        assert!(matches!(
            store.claim_batch(1).await,
            Err(Error::StoreUnavailable(_))
        ));
    }
}
