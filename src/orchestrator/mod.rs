//! Download orchestrator split into focused submodules.
//!
//! The `DownloadOrchestrator` struct and its methods are organized by domain:
//! - [`submit`] - Task creation and destination naming
//! - [`control`] - Pause, resume and cancel
//! - [`worker`] - Transfer runs, outcome handling and retry wiring
//! - [`progress`] - Progress intake and snapshot publication
//! - [`history`] - Terminal transitions, history log and persistence
//! - [`lifecycle`] - Shutdown coordination

mod control;
mod history;
mod lifecycle;
mod progress;
mod submit;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::error::Result;
use crate::history_store::HistoryStore;
use crate::retry::RetryScheduler;
use crate::transfer::{HttpTransfer, Transfer};
use crate::types::{DownloadTask, Event, ProgressSnapshot, QueueStats, Status, TaskId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Live record of a task in the active set
pub(crate) struct TaskEntry {
    pub(crate) task: DownloadTask,
    /// Bumped whenever a run starts or is halted; outcomes tagged with an
    /// older generation are ignored
    pub(crate) generation: u64,
    /// Cancels the current run (None when no run is in flight)
    pub(crate) run_token: Option<CancellationToken>,
}

impl TaskEntry {
    pub(crate) fn new(task: DownloadTask) -> Self {
        Self {
            task,
            generation: 0,
            run_token: None,
        }
    }

    /// Invalidate the current run and signal it to stop
    pub(crate) fn halt_run(&mut self) {
        self.generation += 1;
        if let Some(token) = self.run_token.take() {
            token.cancel();
        }
    }
}

/// Active set and history log
#[derive(Clone)]
pub(crate) struct TaskState {
    /// Tasks that are queued, running, paused or inside their retention window
    pub(crate) active: Arc<DashMap<TaskId, TaskEntry>>,
    /// Terminal tasks, oldest first (bounded by `history_limit`)
    pub(crate) history: Arc<std::sync::Mutex<VecDeque<DownloadTask>>>,
    /// Next task ID to hand out
    pub(crate) next_id: Arc<AtomicU64>,
}

/// Worker slots and shutdown coordination
#[derive(Clone)]
pub(crate) struct WorkerState {
    /// Semaphore to limit concurrent transfers (respects max_concurrent_downloads config)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Number of spawned workers that have not finished yet
    pub(crate) running: Arc<AtomicUsize>,
    /// Flag to indicate whether new tasks are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Parent of every run token; cancelled on shutdown
    pub(crate) shutdown_token: CancellationToken,
}

/// Optional history persistence
#[derive(Clone, Default)]
pub(crate) struct HistoryPersistence {
    pub(crate) store: Option<Arc<dyn HistoryStore>>,
    /// Serializes saves so the latest log always lands last
    pub(crate) lock: Arc<tokio::sync::Mutex<()>>,
}

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct DownloadOrchestrator {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Transfer capability used for every run
    pub(crate) transfer: Arc<dyn Transfer>,
    /// Backoff timers for failed runs
    pub(crate) retry_scheduler: RetryScheduler,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Latest progress snapshot
    pub(crate) snapshot_tx: Arc<watch::Sender<ProgressSnapshot>>,
    pub(crate) state: TaskState,
    pub(crate) workers: WorkerState,
    pub(crate) persistence: HistoryPersistence,
}

impl DownloadOrchestrator {
    /// Create a new orchestrator using `transfer` for every run
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if the configuration is invalid.
    pub fn new(config: Config, transfer: Arc<dyn Transfer>) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(config.download.event_buffer);
        let (snapshot_tx, _rx) = watch::channel(ProgressSnapshot::empty());

        let workers = WorkerState {
            concurrent_limit: Arc::new(Semaphore::new(config.download.max_concurrent_downloads)),
            running: Arc::new(AtomicUsize::new(0)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown_token: CancellationToken::new(),
        };

        let state = TaskState {
            active: Arc::new(DashMap::new()),
            history: Arc::new(std::sync::Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        tracing::info!(
            transfer = transfer.name(),
            max_concurrent = config.download.max_concurrent_downloads,
            max_attempts = config.retry.max_attempts,
            "Download orchestrator created"
        );

        Ok(Self {
            config: Arc::new(config),
            transfer,
            retry_scheduler: RetryScheduler::new(),
            event_tx,
            snapshot_tx: Arc::new(snapshot_tx),
            state,
            workers,
            persistence: HistoryPersistence::default(),
        })
    }

    /// Create an orchestrator that downloads over HTTP(S)
    pub fn with_http(config: Config) -> Result<Self> {
        let transfer = HttpTransfer::new()?;
        Self::new(config, Arc::new(transfer))
    }

    /// Configuration this orchestrator runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Retry scheduler driving backoff for failed runs
    pub fn retry_scheduler(&self) -> &RetryScheduler {
        &self.retry_scheduler
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber receives every event emitted after subscribing. Slow
    /// subscribers that fall more than `event_buffer` events behind observe
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Receiver that always holds the latest progress snapshot
    pub fn watch_snapshots(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Stream of snapshots, starting with the current one
    pub fn snapshot_stream(&self) -> tokio_stream::wrappers::WatchStream<ProgressSnapshot> {
        tokio_stream::wrappers::WatchStream::new(self.watch_snapshots())
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Active tasks ordered by ID
    pub fn list_active(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self
            .state
            .active
            .iter()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    /// Look up a task in the active set, then in the history log
    pub fn task(&self, id: TaskId) -> Option<DownloadTask> {
        if let Some(entry) = self.state.active.get(&id) {
            return Some(entry.task.clone());
        }
        self.lock_history()
            .iter()
            .rev()
            .find(|task| task.id == id)
            .cloned()
    }

    /// Counts of active tasks by status
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.state.active.iter() {
            stats.total += 1;
            match entry.task.status {
                Status::Queued => stats.queued += 1,
                Status::Downloading => stats.downloading += 1,
                Status::Paused => stats.paused += 1,
                Status::Completed | Status::Failed | Status::Cancelled => stats.finished += 1,
            }
        }
        stats.history = self.lock_history().len();
        stats
    }

    /// Send an event to subscribers (no-op when nobody listens)
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Rebuild the snapshot from the active set and publish it
    ///
    /// Must not be called while holding a guard into `state.active`.
    pub(crate) fn publish_snapshot(&self) {
        let tasks = self
            .state
            .active
            .iter()
            .map(|entry| (*entry.key(), entry.task.progress()))
            .collect();
        self.snapshot_tx.send_replace(ProgressSnapshot {
            tasks,
            taken_at: chrono::Utc::now(),
        });
    }
}
