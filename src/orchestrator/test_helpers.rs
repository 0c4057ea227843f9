//! Shared test helpers for creating DownloadOrchestrator instances in tests.

use crate::config::Config;
use crate::error::TransferError;
use crate::orchestrator::DownloadOrchestrator;
use crate::transfer::{ProgressReporter, Transfer, TransferComplete, TransferRequest};
use crate::types::{DownloadTask, Event, Status, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// What one scripted run does
#[derive(Clone, Debug)]
pub(crate) enum Step {
    /// Report half, then all of `total` bytes and succeed
    Succeed { total: u64 },
    /// Report a little progress, then fail with a retryable network error
    Fail,
    /// Fail with HTTP 404
    FailPermanent,
    /// Report 100 bytes past the resume offset, then wait for cancellation
    Hang,
    /// Panic inside the transfer
    Panic,
}

/// A recorded call to [`ScriptedTransfer::fetch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) source: String,
    pub(crate) resume_from: u64,
}

/// Transfer that plays back per-source scripts
pub(crate) struct ScriptedTransfer {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Step,
    calls: Mutex<Vec<Call>>,
    resumable: bool,
}

impl ScriptedTransfer {
    /// Every run without a script does `fallback`
    pub(crate) fn new(fallback: Step) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            resumable: true,
        }
    }

    pub(crate) fn non_resumable(mut self) -> Self {
        self.resumable = false;
        self
    }

    /// Queue `steps` for runs of `source`
    pub(crate) fn script(&self, source: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .extend(steps);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_for(&self, source: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.source == source)
            .count()
    }
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
    ) -> Result<TransferComplete, TransferError> {
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.source)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone());
        self.calls.lock().unwrap().push(Call {
            source: request.source.clone(),
            resume_from: request.resume_from,
        });

        match step {
            Step::Succeed { total } => {
                progress.report(total / 2, Some(total));
                tokio::task::yield_now().await;
                progress.report(total, Some(total));
                Ok(TransferComplete { total_bytes: total })
            }
            Step::Fail => {
                progress.report(request.resume_from + 10, Some(1000));
                Err(TransferError::Network("simulated connection reset".to_string()))
            }
            Step::FailPermanent => Err(TransferError::Http { status: 404 }),
            Step::Hang => {
                progress.report(request.resume_from + 100, Some(1000));
                request.cancel.cancelled().await;
                Err(TransferError::Cancelled)
            }
            Step::Panic => panic!("scripted transfer panic"),
        }
    }

    fn supports_resume(&self) -> bool {
        self.resumable
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Config with short delays suitable for tests
pub(crate) fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.join("downloads");
    config.download.max_concurrent_downloads = 3;
    config.download.shutdown_timeout = Duration::from_secs(2);
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(40);
    config
}

/// Helper to create a test orchestrator around a scripted transfer.
/// Returns the tempdir too (which must be kept alive).
pub(crate) fn create_test_orchestrator(
    transfer: ScriptedTransfer,
    tweak: impl FnOnce(&mut Config),
) -> (DownloadOrchestrator, Arc<ScriptedTransfer>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    tweak(&mut config);

    let transfer = Arc::new(transfer);
    let orchestrator = DownloadOrchestrator::new(config, transfer.clone()).unwrap();
    (orchestrator, transfer, temp_dir)
}

/// Poll until the task reaches `status` (panics after 2 seconds)
pub(crate) async fn wait_for_status(
    orchestrator: &DownloadOrchestrator,
    id: TaskId,
    status: Status,
) -> DownloadTask {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(task) = orchestrator.task(id) {
            if task.status == status {
                return task;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {id} never reached {status:?}, last seen {:?}",
                orchestrator.task(id).map(|t| t.status)
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until `condition` holds (panics after 2 seconds)
pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain everything currently buffered in an event receiver
pub(crate) fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Receive events until one matches `pred`; returns everything received,
/// the match last (panics after 2 seconds)
pub(crate) async fn collect_events_until(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await;
    if result.is_err() {
        panic!("timed out waiting for event, saw {seen:?}");
    }
    seen
}
