//! Task creation and destination naming.

use crate::error::{Error, Result};
use crate::types::{ContentClass, DownloadTask, Event, Status, TaskId};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use super::worker::RunKind;
use super::{DownloadOrchestrator, TaskEntry};

/// Longest title fragment kept in a file name
const MAX_TITLE_CHARS: usize = 100;

impl DownloadOrchestrator {
    /// Submit a new download
    ///
    /// The task is created QUEUED and moves to DOWNLOADING before this call
    /// returns if a worker slot is free; otherwise it waits for one. An empty
    /// title falls back to the configured `default_title`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSource`] for an empty source
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::RuntimeUnavailable`] when called outside a tokio runtime
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use download_orchestrator::*;
    /// # async fn example(orchestrator: DownloadOrchestrator) -> Result<()> {
    /// let id = orchestrator.submit(
    ///     "https://cdn.example.com/clip.mp4",
    ///     "Holiday clip",
    ///     ContentClass::General,
    /// )?;
    /// println!("queued as {id}");
    /// # Ok(())
    /// # }
    /// ```
    pub fn submit(&self, source: &str, title: &str, classification: ContentClass) -> Result<TaskId> {
        if self.is_shutdown() {
            return Err(Error::ShuttingDown);
        }

        let source = source.trim();
        if source.is_empty() {
            return Err(Error::InvalidSource(
                "source locator must not be empty".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        let id = TaskId(self.state.next_id.fetch_add(1, Ordering::SeqCst));
        let title = match title.trim() {
            "" => self.config.download.default_title.clone(),
            title => title.to_string(),
        };
        let destination = destination_for(self.config.download_dir(), id, source, &title);
        let now = chrono::Utc::now();

        let task = DownloadTask {
            id,
            source: source.to_string(),
            title: title.clone(),
            classification,
            destination,
            total_bytes: None,
            bytes_transferred: 0,
            status: Status::Queued,
            attempts: 1,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.state.active.insert(id, TaskEntry::new(task));

        // Lost the race against shutdown: the sweep may already have run
        if self.is_shutdown() {
            self.state.active.remove(&id);
            return Err(Error::ShuttingDown);
        }

        tracing::info!(
            task_id = id.0,
            source,
            title = %title,
            ?classification,
            "Download queued"
        );
        self.emit_event(Event::Queued { id, title });

        let permit = std::sync::Arc::clone(&self.workers.concurrent_limit)
            .try_acquire_owned()
            .ok();
        if permit.is_some() {
            if let Some(mut entry) = self.state.active.get_mut(&id) {
                entry.task.status = Status::Downloading;
            }
        }

        match self.begin_run(id, RunKind::Initial) {
            Some(ticket) => self.spawn_worker(ticket, permit, &runtime),
            None => tracing::debug!(task_id = id.0, "Task left the queue before its first run"),
        }
        self.publish_snapshot();

        Ok(id)
    }
}

/// `<download_dir>/<id>_<sanitized title><extension of the source path>`
pub(crate) fn destination_for(dir: &Path, id: TaskId, source: &str, title: &str) -> PathBuf {
    let mut name = format!("{}_{}", id, sanitize_file_name(title));
    if let Some(extension) = source_extension(source) {
        let suffix = format!(".{}", extension);
        if !name.to_lowercase().ends_with(&suffix) {
            name.push_str(&suffix);
        }
    }
    dir.join(name)
}

/// Extension of the last path segment of a URL source, lowercased
fn source_extension(source: &str) -> Option<String> {
    let url = url::Url::parse(source).ok()?;
    let file_name = url.path_segments()?.next_back()?.to_string();
    let extension = Path::new(&file_name).extension()?.to_str()?.to_lowercase();
    let valid = !extension.is_empty()
        && extension.len() <= 8
        && extension.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(extension)
}

/// Make a title safe to use as a file name component
pub(crate) fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators_and_specials() {
        assert_eq!(sanitize_file_name("My Clip: part 1/2"), "My_Clip__part_1_2");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_file_name("???"), "download");
        assert_eq!(sanitize_file_name("Ünïcode ok"), "Ünïcode_ok");
    }

    #[test]
    fn sanitize_truncates_long_titles() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_file_name(&long).chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn destination_uses_source_extension() {
        let path = destination_for(
            Path::new("/data"),
            TaskId(7),
            "https://cdn.example.com/media/clip.MP4?token=abc",
            "Holiday",
        );
        assert_eq!(path, PathBuf::from("/data/7_Holiday.mp4"));
    }

    #[test]
    fn destination_does_not_duplicate_extension() {
        let path = destination_for(
            Path::new("/data"),
            TaskId(1),
            "https://cdn.example.com/clip.mp4",
            "clip.mp4",
        );
        assert_eq!(path, PathBuf::from("/data/1_clip.mp4"));
    }

    #[test]
    fn destination_without_extension() {
        let path = destination_for(
            Path::new("/data"),
            TaskId(2),
            "https://cdn.example.com/stream",
            "Live",
        );
        assert_eq!(path, PathBuf::from("/data/2_Live"));

        let opaque = destination_for(Path::new("/data"), TaskId(3), "not a url", "X");
        assert_eq!(opaque, PathBuf::from("/data/3_X"));
    }
}
