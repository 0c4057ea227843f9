//! Custom test assertions for integration tests

use download_orchestrator::{DownloadOrchestrator, Event, Status, TaskId};
use std::time::Duration;
use tokio::sync::broadcast;

/// Result of waiting for a task to finish
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// Task completed successfully
    Completed,
    /// Task failed with error
    Failed(String),
    /// Task was cancelled
    Cancelled,
    /// Timeout waiting for completion
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for a task to reach a terminal state, using an existing subscription
///
/// Subscribe before submitting so that fast tasks are not missed.
pub async fn wait_for_completion(
    events: &mut broadcast::Receiver<Event>,
    id: TaskId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::Completed { id: event_id, .. }) if event_id == id => {
                    return WaitResult::Completed;
                }
                Ok(Event::Failed {
                    id: event_id,
                    error,
                    ..
                }) if event_id == id => {
                    return WaitResult::Failed(error);
                }
                Ok(Event::Cancelled { id: event_id }) if event_id == id => {
                    return WaitResult::Cancelled;
                }
                Ok(_) => {
                    // Other events, continue waiting
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return WaitResult::ChannelClosed;
                }
            }
        }
    })
    .await;

    match result {
        Ok(wait_result) => wait_result,
        Err(_) => WaitResult::Timeout,
    }
}

/// Collect events until `predicate` matches (inclusive), or the timeout elapses
pub async fn collect_events_until<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: F,
) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = predicate(&event);
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    collected
}

/// Poll until `condition` holds or panic after `timeout`
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert that a task is known and has the expected status
pub fn assert_task_status(orchestrator: &DownloadOrchestrator, id: TaskId, expected: Status) {
    let task = orchestrator
        .task(id)
        .unwrap_or_else(|| panic!("task {id} not found"));
    assert_eq!(
        task.status, expected,
        "task {id} has status {:?}, expected {:?}",
        task.status, expected
    );
}
