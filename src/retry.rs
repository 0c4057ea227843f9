//! Retry scheduling with exponential backoff
//!
//! [`RetryScheduler`] owns one retry chain per task ID. A chain waits for the
//! backoff delay, runs the operation, and keeps going with a growing delay
//! until the operation succeeds or the attempt index reaches
//! `max_attempts`. Giving up is silent: the caller decides how a terminal
//! failure is surfaced.
//!
//! # Example
//!
//! ```no_run
//! use download_orchestrator::config::RetryConfig;
//! use download_orchestrator::retry::RetryScheduler;
//! use download_orchestrator::types::TaskId;
//!
//! # async fn example() -> download_orchestrator::Result<()> {
//! let scheduler = RetryScheduler::new();
//! scheduler.schedule_retry(TaskId(1), 0, RetryConfig::default(), || async {
//!     // Re-run the failed operation here
//!     Ok::<(), std::io::Error>(())
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, Result, TransferError};
use crate::types::TaskId;
use dashmap::DashMap;
use futures::FutureExt;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (not found, permission denied, cancelled) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

fn io_error_is_retryable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Timeout => true,
            // Request timeout, throttling and server-side errors
            TransferError::Http { status } => matches!(status, 408 | 429 | 500..=599),
            TransferError::Io(e) => io_error_is_retryable(e),
            TransferError::Cancelled => false,
            // Unclassified failures go through the normal retry budget
            TransferError::Other(_) => true,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Transfer(e) => e.is_retryable(),
            Error::Io(e) => io_error_is_retryable(e),
            Error::Config { .. }
            | Error::InvalidSource(_)
            | Error::Download(_)
            | Error::ShuttingDown
            | Error::RuntimeUnavailable(_)
            | Error::Serialization(_)
            | Error::Other(_) => false,
        }
    }
}

/// Outcome of [`RetryScheduler::schedule_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySchedule {
    /// A retry will run after `delay`
    Scheduled {
        /// Delay before the next run
        delay: Duration,
    },
    /// The attempt index already reached `max_attempts`; nothing was scheduled
    Exhausted,
}

/// Pending retry chain for one task
struct RetryRecord {
    /// Identifies the chain that owns this record
    chain: u64,
    /// Attempt index of the next run
    attempt: u32,
    /// Delay that follows if the run in flight fails
    next_delay: Option<Duration>,
    policy: RetryConfig,
    cancel: CancellationToken,
}

/// Per-task retry timers with exponential backoff (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct RetryScheduler {
    records: Arc<DashMap<TaskId, RetryRecord>>,
    next_chain: Arc<AtomicU64>,
    /// Parent of every chain token; cancelled on shutdown
    shutdown_token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            next_chain: Arc::new(AtomicU64::new(1)),
            shutdown_token: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule `operation` to run after the backoff delay for `attempt`
    ///
    /// `attempt` is the number of prior retries for this task, so the first
    /// retry uses `attempt = 0` and waits `initial_delay`. Any chain already
    /// pending for `task_id` is cancelled first. When the operation fails (or
    /// panics) the chain continues with `attempt + 1` until `max_attempts`.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`Error::Config`] when the policy is invalid
    /// - [`Error::RuntimeUnavailable`] when called outside a tokio runtime
    pub fn schedule_retry<F, Fut, E>(
        &self,
        task_id: TaskId,
        attempt: u32,
        policy: RetryConfig,
        operation: F,
    ) -> Result<RetrySchedule>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        policy.validate()?;

        if attempt >= policy.max_attempts {
            tracing::debug!(
                task_id = task_id.0,
                attempt,
                max_attempts = policy.max_attempts,
                "Retry budget exhausted, not scheduling"
            );
            return Ok(RetrySchedule::Exhausted);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        let chain = self.next_chain.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown_token.child_token();
        let delay = retry_delay(&policy, attempt);

        let record = RetryRecord {
            chain,
            attempt,
            next_delay: None,
            policy: policy.clone(),
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.records.insert(task_id, record) {
            tracing::debug!(
                task_id = task_id.0,
                previous_attempt = previous.attempt,
                "Replacing pending retry"
            );
            previous.cancel.cancel();
        }

        tracing::debug!(
            task_id = task_id.0,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        runtime.spawn(run_chain(
            Arc::clone(&self.records),
            task_id,
            chain,
            attempt,
            delay,
            policy,
            cancel,
            operation,
        ));

        Ok(RetrySchedule::Scheduled { delay })
    }

    /// Cancel the pending retry for `task_id`
    ///
    /// Returns false if nothing was pending. An operation that is currently
    /// running inside the chain is dropped at its next suspension point.
    pub fn cancel_retry(&self, task_id: TaskId) -> bool {
        match self.records.remove(&task_id) {
            Some((_, record)) => {
                record.cancel.cancel();
                tracing::debug!(task_id = task_id.0, "Cancelled pending retry");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending retry
    pub fn cancel_all_retries(&self) {
        let mut cancelled = 0usize;
        self.records.retain(|_, record| {
            record.cancel.cancel();
            cancelled += 1;
            false
        });
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled all pending retries");
        }
    }

    /// Cancel everything and refuse further scheduling
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all_retries();
        self.shutdown_token.cancel();
        tracing::debug!("Retry scheduler shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a retry chain is pending for `task_id`
    pub fn has_pending(&self, task_id: TaskId) -> bool {
        self.records.contains_key(&task_id)
    }

    /// Attempt index of the next run of the pending chain, if any
    pub fn pending_attempt(&self, task_id: TaskId) -> Option<u32> {
        self.records.get(&task_id).map(|record| record.attempt)
    }

    /// Backoff the chain will wait if its current run fails
    ///
    /// Set while a run of the chain is in flight and a further attempt is
    /// still within budget. Includes jitter, so it is the delay actually slept.
    pub fn upcoming_delay(&self, task_id: TaskId) -> Option<Duration> {
        self.records.get(&task_id).and_then(|record| record.next_delay)
    }

    /// Policy the pending chain runs under
    pub fn pending_policy(&self, task_id: TaskId) -> Option<RetryConfig> {
        self.records.get(&task_id).map(|record| record.policy.clone())
    }

    /// Number of pending retry chains
    pub fn pending_count(&self) -> usize {
        self.records.len()
    }
}

/// Drive one retry chain until success, give-up or cancellation
#[allow(clippy::too_many_arguments)]
async fn run_chain<F, Fut, E>(
    records: Arc<DashMap<TaskId, RetryRecord>>,
    task_id: TaskId,
    chain: u64,
    mut attempt: u32,
    mut delay: Duration,
    policy: RetryConfig,
    cancel: CancellationToken,
    operation: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        tracing::debug!(
            task_id = task_id.0,
            attempt = attempt + 1,
            "Running scheduled retry"
        );

        let next_delay =
            (attempt + 1 < policy.max_attempts).then(|| retry_delay(&policy, attempt + 1));
        if let Some(mut record) = records.get_mut(&task_id) {
            if record.chain == chain {
                record.next_delay = next_delay;
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(async { operation().await }).catch_unwind() => outcome,
        };

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(
                    task_id = task_id.0,
                    attempt = attempt + 1,
                    "Retry succeeded"
                );
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    task_id = task_id.0,
                    attempt = attempt + 1,
                    error = %e,
                    "Retry attempt failed"
                );
            }
            Err(_) => {
                tracing::error!(
                    task_id = task_id.0,
                    attempt = attempt + 1,
                    "Retry operation panicked"
                );
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        attempt += 1;
        if attempt >= policy.max_attempts {
            tracing::debug!(
                task_id = task_id.0,
                max_attempts = policy.max_attempts,
                "Max retry attempts reached, giving up"
            );
            break;
        }

        delay = next_delay.unwrap_or_else(|| retry_delay(&policy, attempt));
        if let Some(mut record) = records.get_mut(&task_id) {
            if record.chain == chain {
                record.attempt = attempt;
                record.next_delay = None;
            }
        }
        tracing::debug!(
            task_id = task_id.0,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling next retry"
        );
    }

    records.remove_if(&task_id, |_, record| record.chain == chain);
}

/// Backoff delay for `attempt`, with jitter when the policy asks for it
fn retry_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let delay = policy.delay_for_attempt(attempt);
    if policy.jitter {
        add_jitter(delay).min(policy.max_delay)
    } else {
        delay
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
