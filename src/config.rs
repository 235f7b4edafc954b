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


//! Orchestrator settings
//!
//! Settings are owned by the app's settings screen and handed to the
//! orchestrator at construction and on every change. The core never writes
//! them back.

use crate::error::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest accepted concurrency limit for local downloads
pub const MIN_CONCURRENCY: usize = 1;

/// Highest accepted concurrency limit for local downloads
pub const MAX_CONCURRENCY: usize = 4;

/// Default reconciliation interval (2 seconds)
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default timeout for a single optimization-server request
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// How a download request is fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMethod {
    /// Stream is remuxed by the media server and fetched through the local queue
    Remux,
    /// Item is transcoded by the optimization server, then fetched when ready
    Optimized,
}

impl Default for DownloadMethod {
    fn default() -> Self {
        DownloadMethod::Remux
    }
}

/// Externally supplied configuration consumed by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Base URL of the optimization server (e.g. `https://optimize.example.com`)
    pub optimized_server_url: Option<String>,

    /// Download method selected by the user
    pub download_method: DownloadMethod,

    /// Maximum concurrently executing local downloads (1-4)
    pub concurrency_limit: usize,

    /// Start the transfer as soon as an optimized job completes
    pub auto_download: bool,

    /// Reconciliation interval in milliseconds
    pub poll_interval_ms: u64,

    /// Timeout for optimization-server requests in milliseconds
    pub request_timeout_ms: u64,

    /// Directory downloaded files are written to
    pub download_directory: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            optimized_server_url: None,
            download_method: DownloadMethod::default(),
            concurrency_limit: 2,
            auto_download: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            download_directory: PathBuf::from("downloads"),
        }
    }
}

impl OrchestratorSettings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    /// Load settings from a JSON file (desktop CLI only; the app passes them in)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let settings: Self = serde_json::from_str(&json)?;
        settings.validated()
    }

    /// Clamp the concurrency limit and reject unusable values
    pub fn validated(mut self) -> Result<Self> {
        self.concurrency_limit = clamp_concurrency(self.concurrency_limit);

        if self.poll_interval_ms == 0 {
            return Err(OfflineError::InvalidInput(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        if let Some(url) = self.optimized_server_url.as_deref() {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                self.optimized_server_url = None;
            } else {
                url::Url::parse(trimmed)?;
                self.optimized_server_url = Some(trimmed.trim_end_matches('/').to_string());
            }
        }

        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Request timeout, never longer than the poll interval so a tick cannot
    /// outlive its slot
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.min(self.poll_interval_ms.max(1)))
    }

    pub fn is_optimized(&self) -> bool {
        self.download_method == DownloadMethod::Optimized
    }
}

/// Clamp a requested concurrency limit into the supported range
pub fn clamp_concurrency(limit: usize) -> usize {
    limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

/// Builder for OrchestratorSettings
#[derive(Debug)]
pub struct SettingsBuilder {
    settings: OrchestratorSettings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn optimized_server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.settings.optimized_server_url = Some(url.into());
        self
    }

    pub fn download_method(mut self, method: DownloadMethod) -> Self {
        self.settings.download_method = method;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.settings.concurrency_limit = limit;
        self
    }

    pub fn auto_download(mut self, enabled: bool) -> Self {
        self.settings.auto_download = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn download_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.settings.download_directory = dir.into();
        self
    }

    pub fn build(self) -> Result<OrchestratorSettings> {
        self.settings.validated()
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
