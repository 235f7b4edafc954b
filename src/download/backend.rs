// Offline Core - download orchestration for a mobile media client
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Byte transfer primitive
//!
//! On device the host OS owns background transfers; the core only needs "move
//! the bytes at this URL into this file and tell me how far you are". The
//! [`TransferBackend`] trait is that seam. [`HttpTransferBackend`] is the
//! reqwest implementation used on desktop and in the CLI.
//!
//! # Key Features
//! - Streaming download with buffered writes (8KB chunks, 1MB flushes)
//! - HTTP status and write errors classified into [`TransferErrorKind`]
//! - No retry: a failed fetch is final for that transfer
//!
//! Cancellation is done by dropping the future; the caller owns cleanup of
//! the destination file.

use crate::error::{OfflineError, Result, TransferErrorKind};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const DOWNLOAD_BUFF_SZ: usize = 8 * 1024;
const DATA_FLUSH_SZ: u64 = 1024 * 1024;

/// Progress callback: `(bytes_written, total_bytes)`
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// What to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Request headers, `Authorization` included
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Write the body at `request.url` to `destination`, returning bytes written
    async fn fetch(&self, request: &FetchRequest, destination: &Path, progress: ProgressFn<'_>) -> Result<u64>;
}

/// reqwest implementation of [`TransferBackend`]
#[derive(Debug, Clone)]
pub struct HttpTransferBackend {
    client: Client,
}

impl HttpTransferBackend {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn write_error(err: std::io::Error) -> OfflineError {
    OfflineError::transfer(TransferErrorKind::from_io(&err), format!("write failed: {}", err))
}

#[async_trait]
impl TransferBackend for HttpTransferBackend {
    async fn fetch(&self, request: &FetchRequest, destination: &Path, progress: ProgressFn<'_>) -> Result<u64> {
        let mut builder = self.client.get(&request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            OfflineError::transfer(TransferErrorKind::Unknown, format!("request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OfflineError::transfer(
                TransferErrorKind::from_status(status.as_u16()),
                format!("HTTP {}", status.as_u16()),
            ));
        }

        let total = response.content_length().filter(|len| *len > 0);
        progress(0, total);

        let file = File::create(destination).await.map_err(write_error)?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        let mut next_flush = DATA_FLUSH_SZ;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                OfflineError::transfer(TransferErrorKind::Unknown, format!("stream error: {}", e))
            })?;

            writer.write_all(&chunk).await.map_err(write_error)?;
            written += chunk.len() as u64;

            if written >= next_flush {
                writer.flush().await.map_err(write_error)?;
                next_flush = written + DATA_FLUSH_SZ;
            }
            progress(written, total);
        }

        writer.flush().await.map_err(write_error)?;
        writer.into_inner().sync_all().await.map_err(write_error)?;

        if let Some(total) = total {
            if written < total {
                return Err(OfflineError::transfer(
                    TransferErrorKind::Unknown,
                    format!("download incomplete: {}/{} bytes", written, total),
                ));
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enospc_is_no_space_left() {
        let err = write_error(std::io::Error::from_raw_os_error(28));
        assert_eq!(err.transfer_kind(), TransferErrorKind::NoSpaceLeft);

        let err = write_error(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.transfer_kind(), TransferErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transfer_failure() {
        let backend = HttpTransferBackend::new().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let request = FetchRequest {
            url: "http://127.0.0.1:9/download/job".to_string(),
            headers: vec![("Authorization".to_string(), "token".to_string())],
        };

        let err = backend
            .fetch(&request, &temp.path().join("out.part"), &|_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, OfflineError::TransferFailed { kind: TransferErrorKind::Unknown, .. }));
        assert!(!temp.path().join("out.part").exists());
    }
}
