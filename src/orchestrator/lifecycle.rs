//! Shutdown coordination.

use crate::error::Result;
use crate::types::{Event, TaskId};
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::DownloadOrchestrator;

impl DownloadOrchestrator {
    /// Gracefully shut down the orchestrator
    ///
    /// This method performs a shutdown sequence:
    /// 1. Stops accepting new tasks and control operations
    /// 2. Cancels all pending retries and in-flight transfers
    /// 3. Waits for workers to stop, bounded by `shutdown_timeout`
    /// 4. Records every task that had not finished as CANCELLED
    /// 5. Flushes the history store and emits [`Event::Shutdown`]
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.workers.accepting_new.swap(false, Ordering::SeqCst) {
            tracing::debug!("Shutdown already performed");
            return Ok(());
        }
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop timers and running transfers
        self.retry_scheduler.shutdown();
        self.workers.shutdown_token.cancel();
        self.workers.concurrent_limit.close();
        tracing::info!("Signaled cancellation to all transfers");

        // 2. Wait for workers with timeout
        let shutdown_timeout = self.config.download.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, self.wait_for_workers()).await {
            Ok(()) => tracing::info!("All workers stopped"),
            Err(_) => tracing::warn!(
                running = self.workers.running.load(Ordering::SeqCst),
                "Timeout waiting for workers, proceeding with shutdown"
            ),
        }

        // 3. Everything still unfinished ends as cancelled
        let ids: Vec<TaskId> = self.state.active.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0usize;
        for id in ids {
            if let Some(task) = self.mark_cancelled(id) {
                self.emit_event(Event::Cancelled { id });
                self.finalize_terminal(task);
                cancelled += 1;
            }
        }
        self.state.active.clear();
        self.publish_snapshot();
        tracing::info!(cancelled, "Unfinished tasks cancelled");

        // 4. Persist final history
        if let Err(e) = self.flush_history().await {
            tracing::error!(error = %e, "Failed to persist history during shutdown");
            // Continue with shutdown even if persistence fails
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        !self.workers.accepting_new.load(Ordering::SeqCst)
    }

    /// Wait until every spawned worker has returned
    async fn wait_for_workers(&self) {
        loop {
            let running = self.workers.running.load(Ordering::SeqCst);
            if running == 0 {
                return;
            }
            tracing::debug!(running, "Waiting for workers to stop");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
