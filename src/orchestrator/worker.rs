//! Transfer runs, outcome handling and retry wiring.
//!
//! Every run is tagged with the task's generation at the time it started.
//! Pause, cancel and shutdown bump the generation, so whatever a superseded
//! run reports afterwards (progress, success or failure) is dropped here.

use crate::error::TransferError;
use crate::retry::{IsRetryable, RetrySchedule};
use crate::transfer::{ProgressReporter, TransferComplete, TransferRequest};
use crate::types::{DownloadTask, Event, Status, TaskId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

use super::DownloadOrchestrator;

/// Why a run is being started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunKind {
    /// First run after submit
    Initial,
    /// Run fired by the retry scheduler (consumes one attempt)
    Retry,
    /// Run started by resume (does not consume an attempt)
    Resume,
}

/// A prepared run: the request plus the generation it belongs to
pub(crate) struct RunTicket {
    pub(crate) id: TaskId,
    pub(crate) generation: u64,
    pub(crate) attempt: u32,
    pub(crate) request: TransferRequest,
}

/// How a run ended, from the orchestrator's point of view
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Completed,
    /// Terminal failure (permanent error or budget spent)
    Failed(TransferError),
    /// Retryable failure; `retry_index` is the number of retries already made
    Retry {
        retry_index: u32,
        error: TransferError,
    },
    /// The run was halted or replaced before its outcome could apply
    Superseded,
}

/// Decrements the running-worker count when a worker ends (even on panic)
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Decision {
    Completed(DownloadTask),
    Failed(DownloadTask, TransferError),
    Retry { attempt: u32, error: TransferError },
}

impl DownloadOrchestrator {
    /// Prepare a new run for `id`, halting whatever run it had before
    ///
    /// Returns None when the task's current state does not allow a run of
    /// this kind (cancelled, paused by the user, already running, ...).
    pub(crate) fn begin_run(&self, id: TaskId, kind: RunKind) -> Option<RunTicket> {
        let supports_resume = self.transfer.supports_resume();
        let mut entry = self.state.active.get_mut(&id)?;

        let allowed = match kind {
            RunKind::Initial => matches!(entry.task.status, Status::Queued | Status::Downloading),
            RunKind::Retry => entry.task.status == Status::Downloading && entry.run_token.is_none(),
            RunKind::Resume => entry.task.status == Status::Paused,
        };
        if !allowed {
            return None;
        }

        entry.halt_run();
        let token = self.workers.shutdown_token.child_token();
        entry.run_token = Some(token.clone());
        let generation = entry.generation;

        let task = &mut entry.task;
        match kind {
            RunKind::Retry => task.attempts += 1,
            RunKind::Resume => task.status = Status::Downloading,
            RunKind::Initial => {}
        }
        if !supports_resume {
            task.bytes_transferred = 0;
        }
        task.updated_at = chrono::Utc::now();

        Some(RunTicket {
            id,
            generation,
            attempt: task.attempts,
            request: TransferRequest {
                task_id: id,
                source: task.source.clone(),
                destination: task.destination.clone(),
                resume_from: task.bytes_transferred,
                cancel: token,
            },
        })
    }

    /// Spawn a worker for `ticket`
    ///
    /// A retryable failure hands the task to the retry scheduler; retries
    /// then run inside the scheduler's chain rather than through new workers.
    pub(crate) fn spawn_worker(
        &self,
        ticket: RunTicket,
        permit: Option<OwnedSemaphorePermit>,
        runtime: &tokio::runtime::Handle,
    ) {
        let orchestrator = self.clone();
        self.workers.running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(Arc::clone(&self.workers.running));

        runtime.spawn(async move {
            let _guard = guard;
            let id = ticket.id;
            if let RunOutcome::Retry { retry_index, error } =
                orchestrator.execute(ticket, permit).await
            {
                orchestrator.schedule_task_retry(id, retry_index, &error);
            }
        });
    }

    /// Acquire a worker slot, run the transfer and apply its outcome
    pub(crate) async fn execute(
        &self,
        ticket: RunTicket,
        permit: Option<OwnedSemaphorePermit>,
    ) -> RunOutcome {
        let RunTicket {
            id,
            generation,
            attempt,
            request,
        } = ticket;
        let token = request.cancel.clone();

        let _permit = match permit {
            Some(permit) => permit,
            None => tokio::select! {
                permit = Arc::clone(&self.workers.concurrent_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return RunOutcome::Superseded,
                },
                _ = token.cancelled() => return RunOutcome::Superseded,
            },
        };

        if !self.mark_started(id, generation) {
            return RunOutcome::Superseded;
        }

        let resume_from = request.resume_from;
        tracing::info!(
            task_id = id.0,
            attempt,
            resume_from,
            transfer = self.transfer.name(),
            "Transfer started"
        );
        self.emit_event(Event::Started {
            id,
            attempt,
            resume_from,
        });

        let reporter = ProgressReporter::new(id, generation, Arc::new(self.clone()));
        let result = tokio::select! {
            result = AssertUnwindSafe(self.transfer.fetch(request, reporter)).catch_unwind() => {
                result.unwrap_or_else(|_| {
                    tracing::error!(task_id = id.0, "Transfer panicked");
                    Err(TransferError::Other("transfer panicked".to_string()))
                })
            }
            _ = token.cancelled() => return RunOutcome::Superseded,
        };

        // Halted by pause, cancel or shutdown; whoever halted it owns the task now
        if token.is_cancelled() {
            return RunOutcome::Superseded;
        }

        self.finish_run(id, generation, result)
    }

    /// Promote a queued task once its run holds a worker slot
    fn mark_started(&self, id: TaskId, generation: u64) -> bool {
        let promoted = {
            let Some(mut entry) = self.state.active.get_mut(&id) else {
                return false;
            };
            if entry.generation != generation {
                return false;
            }
            match entry.task.status {
                Status::Queued => {
                    entry.task.status = Status::Downloading;
                    entry.task.updated_at = chrono::Utc::now();
                    true
                }
                Status::Downloading => false,
                _ => return false,
            }
        };
        if promoted {
            self.publish_snapshot();
        }
        true
    }

    /// Apply the outcome of run `generation` of task `id`
    pub(crate) fn finish_run(
        &self,
        id: TaskId,
        generation: u64,
        result: Result<TransferComplete, TransferError>,
    ) -> RunOutcome {
        let max_attempts = self.config.retry.max_attempts;

        let decision = {
            let Some(mut entry) = self.state.active.get_mut(&id) else {
                return RunOutcome::Superseded;
            };
            if entry.generation != generation || entry.task.status != Status::Downloading {
                tracing::debug!(
                    task_id = id.0,
                    generation,
                    current_generation = entry.generation,
                    "Ignoring outcome of superseded run"
                );
                return RunOutcome::Superseded;
            }
            entry.run_token = None;
            let task = &mut entry.task;
            task.updated_at = chrono::Utc::now();

            match result {
                Ok(complete) => {
                    task.status = Status::Completed;
                    task.total_bytes = Some(complete.total_bytes);
                    task.bytes_transferred = complete.total_bytes;
                    task.error = None;
                    Decision::Completed(task.clone())
                }
                Err(error) => {
                    task.error = Some(error.to_string());
                    if !error.is_retryable() || task.attempts >= max_attempts {
                        task.status = Status::Failed;
                        Decision::Failed(task.clone(), error)
                    } else {
                        Decision::Retry {
                            attempt: task.attempts,
                            error,
                        }
                    }
                }
            }
        };

        match decision {
            Decision::Completed(task) => {
                tracing::info!(
                    task_id = id.0,
                    attempts = task.attempts,
                    bytes = task.bytes_transferred,
                    destination = %task.destination.display(),
                    "Download completed"
                );
                self.emit_event(Event::Completed {
                    id,
                    destination: task.destination.clone(),
                });
                self.finalize_terminal(task);
                RunOutcome::Completed
            }
            Decision::Failed(task, error) => {
                tracing::error!(
                    task_id = id.0,
                    attempts = task.attempts,
                    retryable = error.is_retryable(),
                    error = %error,
                    "Download failed"
                );
                // Ends the chain this run may be part of
                self.retry_scheduler.cancel_retry(id);
                self.emit_event(Event::Failed {
                    id,
                    error: error.to_string(),
                    attempts: task.attempts,
                });
                self.finalize_terminal(task);
                RunOutcome::Failed(error)
            }
            Decision::Retry { attempt, error } => {
                tracing::warn!(
                    task_id = id.0,
                    attempt,
                    max_attempts,
                    error = %error,
                    "Transfer failed, retrying"
                );
                self.publish_snapshot();
                RunOutcome::Retry {
                    retry_index: attempt - 1,
                    error,
                }
            }
        }
    }

    /// Hand a failed task to the retry scheduler
    ///
    /// Does nothing when the task was paused, cancelled or restarted after
    /// its run failed.
    pub(crate) fn schedule_task_retry(&self, id: TaskId, retry_index: u32, error: &TransferError) {
        let scheduled = {
            let Some(entry) = self.state.active.get(&id) else {
                tracing::debug!(task_id = id.0, "Task gone before its retry was scheduled");
                return;
            };
            if !awaiting_retry(&entry) {
                tracing::debug!(
                    task_id = id.0,
                    status = ?entry.task.status,
                    "Task left the retry path, not scheduling"
                );
                return;
            }

            // Pause, resume and cancel need this entry, so they see the new record
            let orchestrator = self.clone();
            self.retry_scheduler.schedule_retry(
                id,
                retry_index,
                self.config.retry.clone(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move { orchestrator.run_retry(id).await }
                },
            )
        };

        match scheduled {
            Ok(RetrySchedule::Scheduled { delay }) => {
                self.announce_retry(id, retry_index + 1, delay, error);
            }
            Ok(RetrySchedule::Exhausted) => {
                self.fail_waiting_task(id, "retry budget exhausted".to_string());
            }
            Err(crate::Error::ShuttingDown) => {
                tracing::debug!(task_id = id.0, "Not scheduling retry during shutdown");
            }
            Err(e) => {
                tracing::error!(task_id = id.0, error = %e, "Failed to schedule retry");
                self.fail_waiting_task(id, e.to_string());
            }
        }
    }

    /// One run inside a retry chain
    ///
    /// Returning `Ok` ends the chain; `Err` lets the scheduler back off and
    /// try again.
    async fn run_retry(&self, id: TaskId) -> Result<(), TransferError> {
        let Some(ticket) = self.begin_run(id, RunKind::Retry) else {
            tracing::debug!(task_id = id.0, "Task no longer waiting for a retry");
            return Ok(());
        };

        match self.execute(ticket, None).await {
            RunOutcome::Completed | RunOutcome::Superseded => Ok(()),
            RunOutcome::Failed(error) => Err(error),
            RunOutcome::Retry { retry_index, error } => {
                let still_waiting = self
                    .state
                    .active
                    .get(&id)
                    .is_some_and(|entry| awaiting_retry(&entry));
                if still_waiting {
                    if let Some(delay) = self.retry_scheduler.upcoming_delay(id) {
                        self.announce_retry(id, retry_index + 1, delay, &error);
                    }
                }
                Err(error)
            }
        }
    }

    fn announce_retry(&self, id: TaskId, attempt: u32, delay: Duration, error: &TransferError) {
        let delay_ms = delay.as_millis() as u64;
        tracing::debug!(task_id = id.0, attempt, delay_ms, "Retry scheduled");
        self.emit_event(Event::RetryScheduled {
            id,
            attempt,
            delay_ms,
            error: error.to_string(),
        });
    }

    /// Fail a task that is waiting between runs
    fn fail_waiting_task(&self, id: TaskId, message: String) {
        let failed = {
            let Some(mut entry) = self.state.active.get_mut(&id) else {
                return;
            };
            if !awaiting_retry(&entry) {
                return;
            }
            entry.halt_run();
            entry.task.status = Status::Failed;
            entry.task.error = Some(message.clone());
            entry.task.updated_at = chrono::Utc::now();
            entry.task.clone()
        };

        tracing::error!(task_id = id.0, error = %message, "Download failed");
        self.emit_event(Event::Failed {
            id,
            error: message,
            attempts: failed.attempts,
        });
        self.finalize_terminal(failed);
    }
}

/// Downloading with no run in flight: the state between a failed run and its retry
fn awaiting_retry(entry: &super::TaskEntry) -> bool {
    entry.task.status == Status::Downloading && entry.run_token.is_none()
}
