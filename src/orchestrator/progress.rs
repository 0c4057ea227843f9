//! Progress intake from running transfers.

use crate::transfer::ProgressSink;
use crate::types::{Event, Status, TaskId};

use super::DownloadOrchestrator;

impl ProgressSink for DownloadOrchestrator {
    fn on_progress(
        &self,
        id: TaskId,
        generation: u64,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    ) {
        let progress = {
            let Some(mut entry) = self.state.active.get_mut(&id) else {
                return;
            };
            if entry.generation != generation || entry.task.status != Status::Downloading {
                return;
            }
            let task = &mut entry.task;
            if bytes_total.is_some() {
                task.total_bytes = bytes_total;
            }
            task.bytes_transferred = match task.total_bytes {
                Some(total) => bytes_transferred.min(total),
                None => bytes_transferred,
            };
            task.updated_at = chrono::Utc::now();
            task.progress()
        };

        tracing::trace!(
            task_id = id.0,
            bytes = progress.bytes_transferred,
            total = ?progress.bytes_total,
            "Progress"
        );
        self.emit_event(Event::Progress {
            id,
            percent: progress.percent,
            bytes_transferred: progress.bytes_transferred,
            bytes_total: progress.bytes_total,
        });
        self.publish_snapshot();
    }
}
