//! HTTP patch downloader with resume support
//!
//! A partial file left in the downloading directory by an earlier session is
//! continued with an HTTP range request. Servers that ignore the range get
//! the file rewritten from the start.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use appupdate_engine::{codes, DownloadProgress, OperationFailure, PatchDownloader, PatchRecord, ProgressCallback};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::config::DownloadConfig;

/// Downloads patches over HTTP(S)
pub struct HttpPatchDownloader {
    client: reqwest::Client,
}

impl HttpPatchDownloader {
    /// Create a new downloader
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

fn write_failure(dest: &Path, e: std::io::Error) -> OperationFailure {
    OperationFailure::new(
        codes::WRITE_ERROR,
        format!("{}: {}", dest.display(), e),
    )
}

#[async_trait]
impl PatchDownloader for HttpPatchDownloader {
    #[instrument(skip(self, patch, progress), fields(url = %patch.url))]
    async fn download(
        &self,
        target_version: &str,
        patch: &PatchRecord,
        dest: &Path,
        progress: ProgressCallback,
    ) -> std::result::Result<u64, OperationFailure> {
        // Check if partial download exists
        let existing_size = match fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if let Some(size) = patch.size {
            if existing_size >= size {
                info!(existing = existing_size, "Patch already fully downloaded");
                progress(DownloadProgress::new(target_version, existing_size, Some(size)));
                return Ok(existing_size);
            }
        }

        // Build request with range header for resume
        let mut request = self.client.get(&patch.url);
        if existing_size > 0 {
            info!(existing = existing_size, total = ?patch.size, "Resuming download");
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing_size));
        }

        let response = request.send().await.map_err(|e| {
            OperationFailure::new(codes::NETWORK_ERROR, format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OperationFailure::new(
                codes::HTTP_ERROR,
                format!("server returned {}", status),
            ));
        }

        // Open file for writing (append if resuming)
        let resumed = existing_size > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(dest)
                .await
                .map_err(|e| write_failure(dest, e))?
        } else {
            if existing_size > 0 {
                warn!("Server ignored range request, restarting download");
            }
            File::create(dest).await.map_err(|e| write_failure(dest, e))?
        };

        let mut downloaded = if resumed { existing_size } else { 0 };
        let total = patch
            .size
            .or_else(|| response.content_length().map(|len| len + downloaded));

        // Stream the response body to file
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                OperationFailure::new(codes::NETWORK_ERROR, format!("error reading response: {}", e))
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| write_failure(dest, e))?;
            downloaded += chunk.len() as u64;
            progress(DownloadProgress::new(target_version, downloaded, total));
        }

        file.flush().await.map_err(|e| write_failure(dest, e))?;
        file.sync_all().await.map_err(|e| write_failure(dest, e))?;

        info!(bytes = downloaded, "Patch download finished");
        Ok(downloaded)
    }
}
