//! Test configuration helpers for creating test orchestrators

use download_orchestrator::{Config, DownloadOrchestrator, Transfer};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Config writing into `temp_dir` with millisecond backoff
pub fn fast_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.max_concurrent_downloads = 3;
    config.download.shutdown_timeout = Duration::from_secs(2);
    config.retry.max_attempts = 3;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config
}

/// Create an orchestrator around `transfer`
///
/// Returns the tempdir too (which must be kept alive).
pub fn create_orchestrator(
    transfer: Arc<dyn Transfer>,
    tweak: impl FnOnce(&mut Config),
) -> (DownloadOrchestrator, TempDir) {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let mut config = fast_config(&temp_dir);
    tweak(&mut config);
    let orchestrator = DownloadOrchestrator::new(config, transfer).expect("create orchestrator");
    (orchestrator, temp_dir)
}

/// Create an orchestrator that downloads over HTTP
pub fn create_http_orchestrator(tweak: impl FnOnce(&mut Config)) -> (DownloadOrchestrator, TempDir) {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let mut config = fast_config(&temp_dir);
    tweak(&mut config);
    let orchestrator = DownloadOrchestrator::with_http(config).expect("create orchestrator");
    (orchestrator, temp_dir)
}
