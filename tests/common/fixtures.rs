//! Transfer doubles for integration tests

use async_trait::async_trait;
use download_orchestrator::{
    ProgressReporter, Transfer, TransferComplete, TransferError, TransferRequest,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Size every successful mock transfer reports
pub const MOCK_SIZE: u64 = 4096;

/// Transfer that fails a configurable number of times per source, then succeeds
///
/// Sources containing `"hang"` stream slowly until cancelled instead.
#[derive(Default)]
pub struct MockTransfer {
    failures: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl MockTransfer {
    /// Transfer where every source succeeds on the first try
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `source` fail `times` times before succeeding
    pub fn fail_times(self, source: &str, times: usize) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(source.to_string(), times);
        self
    }

    /// How many runs `source` has seen
    pub fn calls(&self, source: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of runs in flight at once
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transfer for MockTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
    ) -> Result<TransferComplete, TransferError> {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(request.source.clone())
            .or_default() += 1;

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        let should_fail = {
            let mut failures = self.failures.lock().expect("failures lock");
            match failures.get_mut(&request.source) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if request.source.contains("hang") {
            let mut transferred = request.resume_from;
            loop {
                tokio::select! {
                    _ = request.cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        transferred = (transferred + 64).min(MOCK_SIZE - 1);
                        progress.report(transferred, Some(MOCK_SIZE));
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        if should_fail {
            progress.report(request.resume_from + 128, Some(MOCK_SIZE));
            return Err(TransferError::Timeout);
        }

        progress.report(MOCK_SIZE, Some(MOCK_SIZE));
        Ok(TransferComplete {
            total_bytes: MOCK_SIZE,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
