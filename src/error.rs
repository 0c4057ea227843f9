//! Error types for download-orchestrator
//!
//! This module provides the error taxonomy for the library:
//! - [`Error`] - top-level error returned by fallible operations
//! - [`DownloadError`] - task lookup and state-machine violations
//! - [`TransferError`] - failures reported by a [`Transfer`](crate::transfer::Transfer)
//!
//! Transient transfer failures never reach the caller directly; they are
//! absorbed by the retry loop and only surface as a `Failed` task status once
//! the attempt budget is exhausted.

use thiserror::Error;

/// Result type alias for download-orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for download-orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.max_attempts")
        key: Option<String>,
    },

    /// The source locator passed to `submit` is unusable
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Transfer failure
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// No async runtime available to run workers or retry timers
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Task not found in the active set or history
    #[error("download {id} not found")]
    NotFound {
        /// The task ID that was not found
        id: u64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} download {id} in state {current_state}")]
    InvalidState {
        /// The task ID that is in an invalid state for the operation
        id: u64,
        /// The operation that was attempted (e.g., "pause", "resume")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },
}

/// Failure reported by a transfer run
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection-level failure (refused, reset, DNS, ...)
    #[error("network error: {0}")]
    Network(String),

    /// The transfer timed out
    #[error("transfer timed out")]
    Timeout,

    /// The remote answered with a non-success HTTP status
    #[error("HTTP {status}")]
    Http {
        /// HTTP status code
        status: u16,
    },

    /// Writing to the destination failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled (pause, cancel or shutdown)
    #[error("transfer cancelled")]
    Cancelled,

    /// Any other failure
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransferError::Timeout
        } else if let Some(status) = e.status() {
            TransferError::Http {
                status: status.as_u16(),
            }
        } else if e.is_connect() || e.is_request() || e.is_body() {
            TransferError::Network(e.to_string())
        } else {
            TransferError::Other(e.to_string())
        }
    }
}
