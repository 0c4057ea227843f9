//! HTTP(S) transfer with byte-range resume.

use super::{ProgressReporter, Transfer, TransferComplete, TransferRequest};
use crate::error::{Error, Result, TransferError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Default connect timeout for new connections
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time without receiving data before a chunk read fails
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads a URL to a file with reqwest, resuming via `Range` when possible
#[derive(Clone, Debug)]
pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    /// Create a transfer with a default client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, TLS settings, headers, ...)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        progress: ProgressReporter,
    ) -> std::result::Result<TransferComplete, TransferError> {
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut builder = self.client.get(&request.source);
        if request.resume_from > 0 {
            builder = builder.header(
                reqwest::header::RANGE,
                format!("bytes={}-", request.resume_from),
            );
        }

        let mut response = tokio::select! {
            response = builder.send() => response?,
            _ = request.cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && request.resume_from > 0 {
            if let Some(complete) = already_complete(&request, &response).await {
                tracing::debug!(
                    task_id = request.task_id.0,
                    total_bytes = complete.total_bytes,
                    "Range starts at end of file, nothing left to fetch"
                );
                progress.report(complete.total_bytes, Some(complete.total_bytes));
                return Ok(complete);
            }
        }
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
            });
        }

        // A 200 on a range request means the server ignored the range
        let resuming = request.resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut transferred = if resuming { request.resume_from } else { 0 };
        let total = response.content_length().map(|len| len + transferred);

        tracing::debug!(
            task_id = request.task_id.0,
            resuming,
            offset = transferred,
            total_bytes = ?total,
            "HTTP transfer started"
        );

        let mut file = if resuming {
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&request.destination)
                .await?
        } else {
            tokio::fs::File::create(&request.destination).await?
        };

        progress.report(transferred, total);

        loop {
            let chunk = tokio::select! {
                chunk = tokio::time::timeout(READ_TIMEOUT, response.chunk()) => {
                    chunk.map_err(|_| TransferError::Timeout)??
                }
                _ = request.cancel.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            progress.report(transferred, total);
        }

        file.flush().await?;

        if let Some(total) = total {
            if transferred < total {
                return Err(TransferError::Network(format!(
                    "connection closed after {} of {} bytes",
                    transferred, total
                )));
            }
        }

        Ok(TransferComplete {
            total_bytes: transferred,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// A 416 for `bytes=N-` where N is the full size means the file is already whole
///
/// The size comes from `Content-Range: bytes */N` when the server sends it,
/// and must match both the offset and the file on disk.
async fn already_complete(
    request: &TransferRequest,
    response: &reqwest::Response,
) -> Option<TransferComplete> {
    let size = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes */"))
        .and_then(|size| size.trim().parse::<u64>().ok());
    if size.is_some_and(|size| size != request.resume_from) {
        return None;
    }

    let on_disk = tokio::fs::metadata(&request.destination).await.ok()?.len();
    (on_disk == request.resume_from).then_some(TransferComplete {
        total_bytes: on_disk,
    })
}
