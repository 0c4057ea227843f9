//! End-to-end retry behavior through the public API

mod common;

use common::{
    MOCK_SIZE, MockTransfer, WaitResult, collect_events_until, create_orchestrator,
    wait_for_completion,
};
use download_orchestrator::{ContentClass, Error, Event, Status};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);
const FLAKY: &str = "https://cdn.example.com/flaky.mp4";

#[tokio::test]
async fn test_two_failures_then_success() {
    let transfer = Arc::new(MockTransfer::new().fail_times(FLAKY, 2));
    let (orchestrator, _temp_dir) = create_orchestrator(transfer.clone(), |_| {});
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(FLAKY, "flaky", ContentClass::General).unwrap();
    let seen = collect_events_until(&mut events, TIMEOUT, |e| {
        matches!(e, Event::Completed { .. } | Event::Failed { .. })
    })
    .await;

    assert!(matches!(seen.last(), Some(Event::Completed { .. })));
    let retries = seen
        .iter()
        .filter(|e| matches!(e, Event::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);

    let task = orchestrator.task(id).unwrap();
    assert_eq!(task.status, Status::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.bytes_transferred, MOCK_SIZE);
    assert_eq!(transfer.calls(FLAKY), 3);
    assert!(!orchestrator.retry_scheduler().has_pending(id));
}

#[tokio::test]
async fn test_always_failing_task_stops_at_budget() {
    let transfer = Arc::new(MockTransfer::new().fail_times(FLAKY, usize::MAX));
    let (orchestrator, _temp_dir) = create_orchestrator(transfer.clone(), |config| {
        config.retry.max_attempts = 4;
    });
    let mut events = orchestrator.subscribe();

    let id = orchestrator.submit(FLAKY, "flaky", ContentClass::General).unwrap();
    let result = wait_for_completion(&mut events, id, TIMEOUT).await;
    assert!(matches!(result, WaitResult::Failed(_)));

    let task = orchestrator.task(id).unwrap();
    assert_eq!(task.attempts, 4);
    assert_eq!(transfer.calls(FLAKY), 4);
    assert!(!orchestrator.retry_scheduler().has_pending(id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transfer.calls(FLAKY), 4);
}

#[tokio::test]
async fn test_submit_rejected_after_shutdown() {
    let transfer = Arc::new(MockTransfer::new());
    let (orchestrator, _temp_dir) = create_orchestrator(transfer, |_| {});

    orchestrator.shutdown().await.unwrap();

    let result = orchestrator.submit(FLAKY, "late", ContentClass::General);
    assert!(matches!(result, Err(Error::ShuttingDown)));
    assert!(orchestrator.list_active().is_empty());
}
