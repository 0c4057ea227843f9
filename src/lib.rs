//! # download-orchestrator
//!
//! Retry scheduling and download orchestration core for media downloaders.
//!
//! ## Design Philosophy
//!
//! download-orchestrator is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events and progress snapshots
//! - **Transfer-agnostic** - Bytes move through a pluggable [`Transfer`]
//! - **Sensible defaults** - Works out of the box with zero configuration
//!
//! ## Quick Start
//!
//! ```no_run
//! use download_orchestrator::{Config, ContentClass, DownloadOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = DownloadOrchestrator::with_http(Config::default())?;
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     orchestrator.submit(
//!         "https://cdn.example.com/clip.mp4",
//!         "Holiday clip",
//!         ContentClass::General,
//!     )?;
//!
//!     download_orchestrator::run_with_shutdown(orchestrator).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// History persistence backends
pub mod history_store;
/// Download orchestration (decomposed into focused submodules)
pub mod orchestrator;
/// Retry logic with exponential backoff
pub mod retry;
/// Transfer capability and the HTTP implementation
pub mod transfer;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, RetryConfig};
pub use error::{DownloadError, Error, Result, TransferError};
pub use history_store::{HistoryStore, JsonHistoryStore, MemoryHistoryStore};
pub use orchestrator::DownloadOrchestrator;
pub use retry::{IsRetryable, RetrySchedule, RetryScheduler};
pub use transfer::{
    HttpTransfer, ProgressReporter, ProgressSink, Transfer, TransferComplete, TransferRequest,
};
pub use types::{
    ContentClass, DownloadTask, Event, ProgressSnapshot, QueueStats, Status, TaskId,
    TaskProgress,
};

/// Helper function to run the orchestrator with graceful signal handling.
///
/// Waits for a termination signal and then calls the orchestrator's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use download_orchestrator::{Config, DownloadOrchestrator, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = DownloadOrchestrator::with_http(Config::default())?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(orchestrator).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(orchestrator: DownloadOrchestrator) -> Result<()> {
    wait_for_signal().await;
    orchestrator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
