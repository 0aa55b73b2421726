use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, SceneId};

/// A named processing step. Phases are plain strings rather than a closed
/// enum because trigger rules and per-phase policy are configured, not
/// hardcoded — an operator can introduce a new phase without a recompile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Phase(pub String);

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Phase {
    fn from(value: &str) -> Self {
        Phase::new(value)
    }
}

/// The well-known phases the reference pipeline wires trigger rules for by
/// default. Operators may configure others; these are just the defaults.
pub mod phases {
    pub const METADATA: &str = "metadata";
    pub const THUMBNAIL: &str = "thumbnail";
    pub const SPRITES: &str = "sprites";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const ANIMATED_THUMBNAILS: &str = "animated_thumbnails";
    pub const MARKER_THUMBNAILS: &str = "marker_thumbnails";
}

/// Lifecycle state of a job row in the history store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    /// Terminal states never transition back to pending/running. `Failed`
    /// is only terminal when paired with `is_retryable = false`; the
    /// history row itself, not this enum alone, carries that bit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job priority. Higher runs first; this is a plain `i32` rather than a
/// fixed small enum of bands because manual/bulk submitters need the full
/// range to express "a little more urgent than the default", not just a
/// handful of fixed tiers.
pub const DEFAULT_PRIORITY: i32 = 0;
pub const MANUAL_PRIORITY: i32 = 100;

/// A durable record of one pipeline step for one scene, as stored by the
/// job history store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub scene_id: SceneId,
    pub phase: Phase,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u16,
    pub max_retries: u16,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_retryable: Option<bool>,
    pub force_target: bool,
}

impl JobRecord {
    pub fn new(scene_id: SceneId, phase: Phase, priority: i32, max_retries: u16) -> Self {
        Self {
            id: JobId::new(),
            scene_id,
            phase,
            status: JobStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            next_retry_at: None,
            is_retryable: None,
            force_target: false,
        }
    }

    /// A retry-inheriting variant used by the retry scheduler when it
    /// resubmits a job through the submitter: the new row starts its life
    /// carrying the predecessor's retry count so the backoff sequence
    /// continues rather than restarting.
    pub fn new_retry(
        scene_id: SceneId,
        phase: Phase,
        priority: i32,
        retry_count: u16,
        max_retries: u16,
    ) -> Self {
        let mut record = Self::new(scene_id, phase, priority, max_retries);
        record.retry_count = retry_count;
        record
    }
}

/// Queue entry ordering: priority first (descending), then FIFO within a
/// priority band via a monotonic sequence number. A `BinaryHeap` is a
/// max-heap, so `Ord` here is defined so that "should run first" compares
/// as greater.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub job: JobRecord,
    pub sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority wins; for equal priority the lower sequence
        // (submitted earlier) should be popped first, so we reverse the
        // sequence comparison to keep this a max-heap overall.
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Outcome of running one job, as reported by a worker.
#[derive(Debug)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure(String),
    Cancelled,
    TimedOut,
}
