//! Dispatcher: polls the queue, runs handlers, reconciles outcomes.
//!
//! Each poll claims one batch (one store transaction), executes its items
//! sequentially in `next_attempt_at` order, records every outcome on the
//! batch and commits once. Any number of dispatchers may share a store;
//! claiming guarantees they never run the same item concurrently.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::handler::{HandlerError, HandlerRegistry};
use crate::model::work::WorkItem;
use crate::queue::{ClaimedBatch, QueueStore};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_batch_span, start_dispatch_span};

/// Counts for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Claimed but left untouched because shutdown was requested.
    pub skipped: usize,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

enum Attempt {
    Succeeded,
    Failed(HandlerError),
    Cancelled,
}

/// The poll loop of one dispatcher instance.
pub struct Dispatcher<S: QueueStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    instance: String,
}

impl<S: QueueStore> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            policy: self.policy,
            shutdown: self.shutdown.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl<S: QueueStore> Dispatcher<S> {
    /// The retry budget is the store's, so the dispatcher and the store
    /// always agree on when an item is exhausted.
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: DispatchConfig) -> Self {
        let max_retries = store.max_retries();
        if max_retries != config.max_retries {
            warn!(
                store = max_retries,
                configured = config.max_retries,
                "max_retries differs from the store's, using the store's"
            );
        }
        let policy = RetryPolicy::new(config.backoff_base, max_retries);
        Self {
            store,
            registry,
            config,
            policy,
            shutdown: CancellationToken::new(),
            instance: format!("dispatcher-{}", short_id()),
        }
    }

    /// Stop when `token` is cancelled instead of an internal token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Name used in logs and spans.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Signal the loop to stop after its current batch.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn `count` instances sharing this dispatcher's store, registry and
    /// shutdown token. Instances are named `<instance>-<n>`.
    pub fn spawn_instances(&self, count: usize) -> JoinSet<Result<()>> {
        let mut set = JoinSet::new();
        for i in 0..count {
            let dispatcher = self.clone().with_instance(format!("{}-{i}", self.instance));
            set.spawn(async move { dispatcher.run().await });
        }
        set
    }

    /// Run the poll loop until shutdown.
    ///
    /// Store errors are logged and retried on the next poll; nothing a batch
    /// does can end the loop.
    pub async fn run(&self) -> Result<()> {
        info!(
            instance = %self.instance,
            handlers = self.registry.len(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatcher started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(report) if !report.is_empty() => info!(
                    instance = %self.instance,
                    claimed = report.claimed,
                    completed = report.completed,
                    rescheduled = report.rescheduled,
                    dead_lettered = report.dead_lettered,
                    skipped = report.skipped,
                    "batch committed"
                ),
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(instance = %self.instance, error = %e, "poll failed, will retry")
                }
                Err(e) => error!(instance = %self.instance, error = %e, "poll failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(instance = %self.instance, "dispatcher stopped");
        Ok(())
    }

    /// Claim one batch, execute it and commit the outcomes.
    ///
    /// On error nothing from this batch is visible: every claimed item is
    /// eligible again with its previous state.
    ///
    /// Shutdown while waiting for the store abandons the claim and returns an
    /// empty report.
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let batch = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(BatchReport::default()),
            batch = self.store.claim_batch(self.config.batch_size) => batch?,
        };
        let span = start_batch_span(&self.instance);
        span.record("batch.claimed", batch.items().len());
        self.process(batch).instrument(span).await
    }

    async fn process(&self, mut batch: S::Batch) -> Result<BatchReport> {
        let started = Instant::now();
        let items: Vec<WorkItem> = batch.items().to_vec();
        let mut report = BatchReport {
            claimed: items.len(),
            ..BatchReport::default()
        };

        if items.is_empty() {
            batch.commit().await?;
            return Ok(report);
        }

        for (i, item) in items.iter().enumerate() {
            let item_span = start_dispatch_span(item);
            let attempt = if self.shutdown.is_cancelled() {
                Attempt::Cancelled
            } else {
                self.execute(item).instrument(item_span.clone()).await
            };

            if let Attempt::Cancelled = attempt {
                report.skipped = items.len() - i;
                record_outcome(&item_span, "cancelled");
                info!(id = %item.id, remaining = report.skipped, "shutdown requested, leaving rest of batch");
                break;
            }

            let outcome = match self.record(&mut batch, item, attempt, &mut report).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(id = %item.id, error = %e, "cannot record outcome, rolling back batch");
                    if let Err(rollback) = batch.rollback().await {
                        warn!(error = %rollback, "rollback failed");
                    }
                    record_batch_duration(started, "rolled_back");
                    return Err(e);
                }
            };
            record_outcome(&item_span, outcome);
            metrics::work_outcomes().add(
                1,
                &[
                    KeyValue::new("work_type", item.work_type.clone()),
                    KeyValue::new("outcome", outcome),
                ],
            );
        }

        if let Err(e) = batch.commit().await {
            record_batch_duration(started, "rolled_back");
            return Err(e);
        }
        record_batch_duration(started, "committed");
        Ok(report)
    }

    /// Run the handler for one item, bounded by the handler timeout and
    /// abandoned on shutdown.
    async fn execute(&self, item: &WorkItem) -> Attempt {
        let Some(handler) = self.registry.get(&item.work_type) else {
            metrics::work_unroutable()
                .add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
            return Attempt::Failed(HandlerError::permanent(format!(
                "no handler registered for work type '{}'",
                item.work_type
            )));
        };

        let timeout = self.config.handler_timeout;
        let run = tokio::time::timeout(timeout, handler.execute(&item.payload));
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Attempt::Cancelled,
            result = run => match result {
                Ok(Ok(())) => Attempt::Succeeded,
                Ok(Err(e)) => Attempt::Failed(e),
                Err(_) => Attempt::Failed(HandlerError::transient(format!(
                    "handler timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
        }
    }

    /// Stage the outcome of one attempt on the batch.
    async fn record(
        &self,
        batch: &mut S::Batch,
        item: &WorkItem,
        attempt: Attempt,
        report: &mut BatchReport,
    ) -> Result<&'static str> {
        let error = match attempt {
            Attempt::Succeeded => {
                batch.complete(item.id).await?;
                debug!(id = %item.id, "completed");
                report.completed += 1;
                return Ok("completed");
            }
            Attempt::Failed(error) => error,
            Attempt::Cancelled => return Ok("cancelled"),
        };

        let mut reason = error.to_string();
        let next_attempt_at = if error.is_permanent() {
            None
        } else {
            match self.policy.decide(item.attempt_count) {
                RetryDecision::Retry { delay } => {
                    let next = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|delay| batch.claimed_at().checked_add_signed(delay));
                    if next.is_none() {
                        reason = format!("{reason} (backoff of {delay:?} is out of range)");
                    }
                    next
                }
                RetryDecision::Exhausted => None,
            }
        };

        match next_attempt_at {
            Some(next_attempt_at) => {
                batch.reschedule(item.id, next_attempt_at, &reason).await?;
                warn!(
                    id = %item.id,
                    attempt = item.attempt_count + 1,
                    %next_attempt_at,
                    %reason,
                    "attempt failed, rescheduled"
                );
                report.rescheduled += 1;
                Ok("rescheduled")
            }
            None => {
                batch.dead_letter(item.id, &reason).await?;
                error!(
                    id = %item.id,
                    work_type = %item.work_type,
                    attempts = item.attempt_count + 1,
                    %reason,
                    "dead-lettered"
                );
                report.dead_lettered += 1;
                Ok("dead_lettered")
            }
        }
    }
}

/// Distinguishes dispatchers of different processes in logs.
fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn record_batch_duration(started: Instant, result: &'static str) {
    metrics::batch_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("result", result)],
    );
}
