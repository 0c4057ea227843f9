//! Transfer capability consumed by the orchestrator
//!
//! A [`Transfer`] moves the bytes of one download run: given a source, a
//! destination and a resume offset it streams data, reports
//! `(bytes_transferred, bytes_total)` through a [`ProgressReporter`], and
//! resolves to success or a [`TransferError`]. The orchestrator treats it as
//! an opaque, cancellable dependency.

mod http;

pub use http::HttpTransfer;

use crate::error::TransferError;
use crate::types::TaskId;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a transfer run needs to know
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// Task the run belongs to
    pub task_id: TaskId,
    /// Source locator (URL)
    pub source: String,
    /// Output file
    pub destination: PathBuf,
    /// Byte offset to resume from (0 = start over)
    pub resume_from: u64,
    /// Cancelled when the run is paused, cancelled or shut down
    pub cancel: CancellationToken,
}

/// Successful end of a transfer run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferComplete {
    /// Size of the finished output in bytes
    pub total_bytes: u64,
}

/// Receives progress reports tagged with the run that produced them
pub trait ProgressSink: Send + Sync {
    /// Called for every progress report of run `generation` of task `id`
    fn on_progress(&self, id: TaskId, generation: u64, bytes_transferred: u64, bytes_total: Option<u64>);
}

struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_progress(&self, _id: TaskId, _generation: u64, _bytes: u64, _total: Option<u64>) {}
}

/// Handle a transfer uses to report progress for its run
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    generation: u64,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    /// Create a reporter for run `generation` of `task_id`
    pub fn new(task_id: TaskId, generation: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            task_id,
            generation,
            sink,
        }
    }

    /// Reporter that discards everything (for running a transfer standalone)
    pub fn noop(task_id: TaskId) -> Self {
        Self::new(task_id, 0, Arc::new(NoopSink))
    }

    /// Report the current byte counts
    pub fn report(&self, bytes_transferred: u64, bytes_total: Option<u64>) {
        self.sink
            .on_progress(self.task_id, self.generation, bytes_transferred, bytes_total);
    }

    /// Task this reporter belongs to
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Run generation this reporter is tagged with
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The "perform transfer" capability
///
/// Implementations must observe `request.cancel` at their suspension points;
/// the orchestrator additionally drops the future when the token fires.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Run one transfer attempt
    async fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
    ) -> Result<TransferComplete, TransferError>;

    /// Whether a run can continue from `resume_from` instead of starting over
    fn supports_resume(&self) -> bool {
        true
    }

    /// Human-readable name for logging
    fn name(&self) -> &str;
}
