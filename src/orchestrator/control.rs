//! Download lifecycle control - pause, resume, cancel.
//!
//! All three return `false` instead of an error when the task is unknown or
//! in a state the operation does not apply to, and after shutdown.

use crate::error::DownloadError;
use crate::types::{DownloadTask, Event, Status, TaskId};

use super::DownloadOrchestrator;
use super::worker::RunKind;

impl DownloadOrchestrator {
    /// Pause a downloading task
    ///
    /// Stops the in-flight transfer (or the pending retry) and keeps the
    /// bytes transferred so far so that [`resume`](Self::resume) can continue
    /// from there. Only DOWNLOADING tasks can be paused.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use download_orchestrator::*;
    /// # fn example(orchestrator: DownloadOrchestrator, id: TaskId) {
    /// if !orchestrator.pause(id) {
    ///     println!("task {id} is not downloading");
    /// }
    /// # }
    /// ```
    pub fn pause(&self, id: TaskId) -> bool {
        if self.is_shutdown() {
            return false;
        }

        if let Err(e) = self.check_status(id, "pause", |s| s == Status::Downloading) {
            return rejected(e);
        }

        {
            let Some(mut entry) = self.state.active.get_mut(&id) else {
                return false;
            };
            if entry.task.status != Status::Downloading {
                return false;
            }
            entry.halt_run();
            entry.task.status = Status::Paused;
            entry.task.updated_at = chrono::Utc::now();
        }

        self.retry_scheduler.cancel_retry(id);
        tracing::info!(task_id = id.0, "Download paused");
        self.emit_event(Event::Paused { id });
        self.publish_snapshot();
        true
    }

    /// Resume a paused task
    ///
    /// The new run starts at the stored byte offset when the transfer
    /// supports resuming, otherwise from zero. Resuming does not consume an
    /// attempt from the retry budget.
    pub fn resume(&self, id: TaskId) -> bool {
        if self.is_shutdown() {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(task_id = id.0, "Resume requires a tokio runtime");
            return false;
        };

        if let Err(e) = self.check_status(id, "resume", |s| s == Status::Paused) {
            return rejected(e);
        }

        let Some(ticket) = self.begin_run(id, RunKind::Resume) else {
            return false;
        };

        self.retry_scheduler.cancel_retry(id);
        tracing::info!(
            task_id = id.0,
            resume_from = ticket.request.resume_from,
            "Download resumed"
        );
        self.emit_event(Event::Resumed { id });
        self.publish_snapshot();
        self.spawn_worker(ticket, None, &runtime);
        true
    }

    /// Cancel a task that has not reached a terminal state
    ///
    /// The task leaves the active set immediately and is recorded in the
    /// history as CANCELLED. With `delete_partial_on_cancel` the partial
    /// output file is removed.
    pub fn cancel(&self, id: TaskId) -> bool {
        if self.is_shutdown() {
            return false;
        }

        if let Err(e) = self.check_status(id, "cancel", |s| !s.is_terminal()) {
            return rejected(e);
        }

        let Some(task) = self.mark_cancelled(id) else {
            return false;
        };

        tracing::info!(task_id = id.0, "Download cancelled");
        self.emit_event(Event::Cancelled { id });
        if self.config.download.delete_partial_on_cancel {
            self.remove_partial_file(&task);
        }
        self.finalize_terminal(task);
        true
    }

    /// Check that `id` is active and in a state `operation` applies to
    fn check_status(
        &self,
        id: TaskId,
        operation: &str,
        allowed: impl Fn(Status) -> bool,
    ) -> Result<(), DownloadError> {
        let entry = self
            .state
            .active
            .get(&id)
            .ok_or(DownloadError::NotFound { id: id.0 })?;
        if allowed(entry.task.status) {
            Ok(())
        } else {
            Err(DownloadError::InvalidState {
                id: id.0,
                operation: operation.to_string(),
                current_state: format!("{:?}", entry.task.status),
            })
        }
    }

    /// Move a non-terminal task to CANCELLED, halting its run and retry
    pub(crate) fn mark_cancelled(&self, id: TaskId) -> Option<DownloadTask> {
        let task = {
            let mut entry = self.state.active.get_mut(&id)?;
            if entry.task.status.is_terminal() {
                return None;
            }
            entry.halt_run();
            entry.task.status = Status::Cancelled;
            entry.task.updated_at = chrono::Utc::now();
            entry.task.clone()
        };
        self.retry_scheduler.cancel_retry(id);
        Some(task)
    }

    fn remove_partial_file(&self, task: &DownloadTask) {
        let path = task.destination.clone();
        let id = task.id;
        let remove = async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(task_id = id.0, path = %path.display(), "Removed partial file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    task_id = id.0,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove partial file"
                ),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(remove);
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_file(&task.destination) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(task_id = id.0, error = %e, "Failed to remove partial file");
                    }
                }
            }
        }
    }
}

fn rejected(error: DownloadError) -> bool {
    tracing::debug!(error = %error, "Control operation rejected");
    false
}
