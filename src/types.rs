//! Core types and events for download-orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Unique identifier for a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for u64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Download status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created, waiting for a worker slot
    Queued,
    /// Transfer running or waiting for a scheduled retry
    Downloading,
    /// Paused by user
    Paused,
    /// Successfully completed
    Completed,
    /// Failed after the retry budget was spent (or a permanent error)
    Failed,
    /// Cancelled by user or shutdown
    Cancelled,
}

impl Status {
    /// Terminal states never transition further
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

/// Content classification flag carried with each download
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentClass {
    /// Regular content
    #[default]
    General,
    /// Sensitive or restricted content
    Restricted,
}

/// A single download tracked through its lifecycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Task ID
    pub id: TaskId,
    /// Source locator (URL)
    pub source: String,
    /// Display title
    pub title: String,
    /// Content classification
    pub classification: ContentClass,
    /// Target file path
    pub destination: PathBuf,
    /// Total size in bytes, unknown until the first progress report
    pub total_bytes: Option<u64>,
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Current status
    pub status: Status,
    /// Number of the current (or last) transfer attempt, starting at 1
    pub attempts: u32,
    /// Last failure message
    pub error: Option<String>,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task was last changed
    pub updated_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Progress percentage (0.0 to 100.0)
    pub fn percent(&self) -> f32 {
        if self.status == Status::Completed {
            return 100.0;
        }
        match self.total_bytes {
            Some(total) if total > 0 => {
                ((self.bytes_transferred as f64 / total as f64) * 100.0).min(100.0) as f32
            }
            _ => 0.0,
        }
    }

    /// Progress entry for snapshots
    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            status: self.status,
            percent: self.percent(),
            bytes_transferred: self.bytes_transferred,
            bytes_total: self.total_bytes,
        }
    }
}

/// Per-task entry of a [`ProgressSnapshot`]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Current status
    pub status: Status,
    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Total size if known
    pub bytes_total: Option<u64>,
}

/// Immutable point-in-time view of all active tasks
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Active tasks keyed by ID
    pub tasks: BTreeMap<TaskId, TaskProgress>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Snapshot with no tasks
    pub fn empty() -> Self {
        Self {
            tasks: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }

    /// Progress of one task
    pub fn get(&self, id: TaskId) -> Option<&TaskProgress> {
        self.tasks.get(&id)
    }

    /// Number of tasks in the snapshot
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the snapshot has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Counts of active tasks by status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in the active set
    pub total: usize,
    /// Waiting for a worker slot
    pub queued: usize,
    /// Transferring or waiting for a retry
    pub downloading: usize,
    /// Paused by user
    pub paused: usize,
    /// Terminal tasks still inside their retention window
    pub finished: usize,
    /// Tasks in the history log
    pub history: usize,
}

/// Event emitted during the download lifecycle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task created
    Queued {
        /// Task ID
        id: TaskId,
        /// Display title
        title: String,
    },

    /// Transfer run started
    Started {
        /// Task ID
        id: TaskId,
        /// Attempt number (1-based)
        attempt: u32,
        /// Byte offset the run resumes from
        resume_from: u64,
    },

    /// Progress update
    Progress {
        /// Task ID
        id: TaskId,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Bytes transferred so far
        bytes_transferred: u64,
        /// Total size if known
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
    },

    /// Task paused
    Paused {
        /// Task ID
        id: TaskId,
    },

    /// Task resumed
    Resumed {
        /// Task ID
        id: TaskId,
    },

    /// A failed run will be retried
    RetryScheduled {
        /// Task ID
        id: TaskId,
        /// Attempt number that failed
        attempt: u32,
        /// Backoff delay before the next run (without jitter)
        delay_ms: u64,
        /// Error of the failed run
        error: String,
    },

    /// Task completed
    Completed {
        /// Task ID
        id: TaskId,
        /// Output file
        destination: PathBuf,
    },

    /// Task failed permanently
    Failed {
        /// Task ID
        id: TaskId,
        /// Last error message
        error: String,
        /// Attempts made
        attempts: u32,
    },

    /// Task cancelled
    Cancelled {
        /// Task ID
        id: TaskId,
    },

    /// The active set became empty
    QueueEmpty,

    /// Orchestrator shut down
    Shutdown,
}
