//! Configuration types for download-orchestrator

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download behavior configuration (directories, concurrency, retention)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Download directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent transfer runs (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Number of terminal tasks kept in history (default: 100)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// How long completed/failed tasks stay visible in the active list (default: 0)
    ///
    /// Cancelled tasks always leave the active list immediately.
    #[serde(default, with = "duration_ms_serde")]
    pub terminal_retention: Duration,

    /// Event channel capacity before slow subscribers start lagging (default: 1000)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// How long `shutdown` waits for running transfers to stop (default: 5 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_ms_serde")]
    pub shutdown_timeout: Duration,

    /// Title used when a download is submitted without one (default: "Video")
    #[serde(default = "default_title")]
    pub default_title: String,

    /// Remove the partial output file when a task is cancelled (default: false)
    #[serde(default)]
    pub delete_partial_on_cancel: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            history_limit: default_history_limit(),
            terminal_retention: Duration::ZERO,
            event_buffer: default_event_buffer(),
            shutdown_timeout: default_shutdown_timeout(),
            default_title: default_title(),
            delete_partial_on_cancel: false,
        }
    }
}

/// Retry policy: how often and how fast a failed transfer is reattempted
///
/// `max_attempts` counts every transfer run including the first, so a task
/// that always fails is retried `max_attempts - 1` times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single retry delay (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based count of prior retries)
    ///
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`, computed in
    /// floating-point milliseconds and truncated.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        // `as u64` saturates on overflow/infinity
        let exponential_ms = (initial_ms * self.backoff_multiplier.powf(f64::from(attempt))) as u64;
        Duration::from_millis(exponential_ms.min(max_ms))
    }

    /// Check the policy constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::config(
                "retry.max_attempts",
                "max_attempts must be at least 1",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::config(
                "retry.max_delay",
                format!(
                    "max_delay ({}ms) must not be smaller than initial_delay ({}ms)",
                    self.max_delay.as_millis(),
                    self.initial_delay.as_millis()
                ),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                format!(
                    "backoff_multiplier must be a finite number >= 1.0, got {}",
                    self.backoff_multiplier
                ),
            ));
        }
        Ok(())
    }
}

/// Main configuration for [`DownloadOrchestrator`](crate::DownloadOrchestrator)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy applied to every task
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Get the download directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Parse a JSON configuration document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        Self::from_json_str(&data)
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "download.max_concurrent_downloads",
                "max_concurrent_downloads must be at least 1",
            ));
        }
        if self.download.event_buffer == 0 {
            return Err(Error::config(
                "download.event_buffer",
                "event_buffer must be at least 1",
            ));
        }
        self.retry.validate()
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_history_limit() -> usize {
    100
}

fn default_event_buffer() -> usize {
    1000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_title() -> String {
    "Video".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(30_000)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (integer milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
