//! Terminal transitions, the history log and its persistence.

use crate::error::Result;
use crate::history_store::HistoryStore;
use crate::types::{DownloadTask, Event, Status};
use std::collections::VecDeque;
use std::sync::{Arc, MutexGuard};
use std::sync::atomic::Ordering;

use super::DownloadOrchestrator;

impl DownloadOrchestrator {
    /// Persist the history log to `store` after every terminal transition
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.persistence.store = Some(store);
        self
    }

    /// Load terminal tasks from the attached store into the history log
    ///
    /// Non-terminal entries are skipped. Task IDs handed out afterwards are
    /// larger than every restored ID. Returns the number of tasks restored.
    pub async fn restore_history(&self) -> Result<usize> {
        let Some(store) = self.persistence.store.clone() else {
            return Ok(0);
        };
        let loaded = store.load().await?;

        let restored = {
            let mut history = self.lock_history();
            let mut restored = 0usize;
            for task in loaded.into_iter().filter(|task| task.status.is_terminal()) {
                self.state.next_id.fetch_max(task.id.0 + 1, Ordering::SeqCst);
                history.push_back(task);
                restored += 1;
            }
            trim_history(&mut history, self.config.download.history_limit);
            restored
        };

        tracing::info!(restored, "History restored");
        Ok(restored)
    }

    /// Terminal tasks, oldest first
    pub fn list_history(&self) -> Vec<DownloadTask> {
        self.lock_history().iter().cloned().collect()
    }

    /// Drop every entry from the history log
    pub fn clear_history(&self) {
        let cleared = {
            let mut history = self.lock_history();
            let cleared = history.len();
            history.clear();
            cleared
        };
        tracing::info!(cleared, "History cleared");
        self.persist_history();
    }

    /// Wait for a save of the current history log to finish
    pub async fn flush_history(&self) -> Result<()> {
        let Some(store) = self.persistence.store.clone() else {
            return Ok(());
        };
        let _guard = self.persistence.lock.lock().await;
        let snapshot = self.list_history();
        store.save(&snapshot).await
    }

    pub(crate) fn lock_history(&self) -> MutexGuard<'_, VecDeque<DownloadTask>> {
        // History holds plain data; a panic mid-update cannot break invariants
        self.state
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a task that just reached a terminal state
    ///
    /// Appends it to the history log and removes it from the active set,
    /// immediately for CANCELLED (or when no retention is configured) and
    /// after `terminal_retention` otherwise.
    pub(crate) fn finalize_terminal(&self, task: DownloadTask) {
        let id = task.id;
        let retention = self.config.download.terminal_retention;
        let remove_now = task.status == Status::Cancelled || retention.is_zero();

        {
            let mut history = self.lock_history();
            history.push_back(task);
            trim_history(&mut history, self.config.download.history_limit);
        }

        if remove_now {
            self.state
                .active
                .remove_if(&id, |_, entry| entry.task.status.is_terminal());
            self.after_active_removal();
        } else {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let orchestrator = self.clone();
                    runtime.spawn(async move {
                        tokio::time::sleep(retention).await;
                        let removed = orchestrator
                            .state
                            .active
                            .remove_if(&id, |_, entry| entry.task.status.is_terminal())
                            .is_some();
                        if removed {
                            orchestrator.after_active_removal();
                        }
                    });
                    self.publish_snapshot();
                }
                Err(_) => {
                    self.state
                        .active
                        .remove_if(&id, |_, entry| entry.task.status.is_terminal());
                    self.after_active_removal();
                }
            }
        }

        self.persist_history();
    }

    fn after_active_removal(&self) {
        self.publish_snapshot();
        if self.state.active.is_empty() {
            tracing::debug!("Active set empty");
            self.emit_event(Event::QueueEmpty);
        }
    }

    /// Save the history log in the background
    pub(crate) fn persist_history(&self) {
        if self.persistence.store.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, history not persisted");
            return;
        };
        let orchestrator = self.clone();
        runtime.spawn(async move {
            if let Err(e) = orchestrator.flush_history().await {
                tracing::error!(error = %e, "Failed to persist history");
            }
        });
    }
}

fn trim_history(history: &mut VecDeque<DownloadTask>, limit: usize) {
    while history.len() > limit {
        if let Some(evicted) = history.pop_front() {
            tracing::trace!(task_id = evicted.id.0, "Evicted from history");
        }
    }
}
