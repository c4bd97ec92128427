//! Work item types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A row of the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Monotonically assigned identifier.
    pub id: WorkId,

    /// Selects the handler (e.g. "send_email", "order_created").
    pub work_type: String,

    /// Opaque bytes. Only the handler for `work_type` interprets them.
    pub payload: Vec<u8>,

    /// Failed attempts so far. Never decreases.
    pub attempt_count: u32,

    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Not eligible for claiming before this instant. `None` once the item
    /// is completed or dead-lettered.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,

    /// Most recent failure reason, kept for operators.
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Derive the lifecycle status under the given retry budget.
    pub fn status(&self, max_retries: u32) -> Status {
        if self.completed_at.is_some() {
            Status::Completed
        } else if self.dead_lettered_at.is_some() || self.attempt_count >= max_retries {
            Status::DeadLettered
        } else {
            Status::Pending
        }
    }

    /// Whether a dispatcher may claim this item at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        self.status(max_retries) == Status::Pending
            && self.next_attempt_at.is_some_and(|at| at <= now)
    }

    /// Payload as UTF-8 text, for display.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId(pub i64);

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for WorkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(WorkId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Derived lifecycle status. An in-flight claim is a row lock held by a
/// batch transaction, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for `next_attempt_at`, or due now.
    Pending,
    /// Handler succeeded. Terminal.
    Completed,
    /// Permanent failure or retries exhausted. Terminal, row retained.
    DeadLettered,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::DeadLettered => "dead_lettered",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "completed" => Ok(Status::Completed),
            "dead_lettered" | "dead" => Ok(Status::DeadLettered),
            _ => Err(crate::error::Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// New Work Item (builder)
// ---------------------------------------------------------------------------

/// Parameters for enqueuing work.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub work_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

impl NewWorkItem {
    /// Work due immediately.
    pub fn new(work_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            work_type: work_type.into(),
            payload: payload.into(),
            created_at: now,
            next_attempt_at: now,
        }
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(work_type: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(work_type, serde_json::to_vec(value)?))
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Defer the first attempt.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = at;
        self
    }
}

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub status: Option<Status>,
    pub work_type: Option<String>,
    pub limit: Option<i64>,
}
