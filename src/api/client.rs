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


//! HTTP client for the optimization server's job API
//!
//! # Endpoints
//! - `POST /optimize-version` - create a job (201 + `{ id }`)
//! - `GET /jobs?deviceId=` - list this device's jobs
//! - `DELETE /jobs/{id}` - cancel one job
//! - `DELETE /jobs?deviceId=` - cancel every job of this device
//! - `GET /download/{id}` - finished file stream (consumed by the transfer manager)
//!
//! # Retry Policy
//! None. A failed request is returned to the caller; the reconciliation loop's
//! next tick is the retry. Every request is bounded by the client timeout so a
//! tick never blocks longer than its slot.

use crate::api::models::{CreateJobRequest, CreateJobResponse, Job};
use crate::error::{OfflineError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Where the optimization server lives and how to authenticate against it
///
/// Both fields come from outside the core (settings screen and sign-in), so
/// either may be missing at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerAccess {
    pub base_url: Option<String>,
    /// Full `Authorization` header value
    pub authorization: Option<String>,
}

impl ServerAccess {
    pub fn new(base_url: Option<String>, authorization: Option<String>) -> Self {
        Self {
            base_url,
            authorization,
        }
    }

    /// True when both URL and authorization are present
    pub fn is_complete(&self) -> bool {
        self.resolve().is_ok()
    }

    /// Parsed base URL and authorization, or `ConfigurationError`
    pub fn resolve(&self) -> Result<(Url, &str)> {
        let base = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OfflineError::configuration("optimized server URL is not set"))?;

        let auth = self
            .authorization
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| OfflineError::configuration("authorization is not set"))?;

        // Trailing slash so joins append instead of replacing the last segment
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = Url::parse(&base)
            .map_err(|e| OfflineError::configuration(format!("invalid optimized server URL: {}", e)))?;

        Ok((url, auth))
    }

    /// URL of the finished file for a job (`GET /download/{id}`)
    pub fn download_url(&self, job_id: &str) -> Result<String> {
        let (base, _) = self.resolve()?;
        let url = base.join(&format!("download/{}", urlencoding::encode(job_id)))?;
        Ok(url.to_string())
    }
}

/// The four calls the orchestrator issues against the optimization server
///
/// All of them are idempotent: cancelling a job the server no longer knows is
/// a success.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn list_jobs(&self, server: &ServerAccess, device_id: &str) -> Result<Vec<Job>>;

    /// Returns the server-assigned job id
    async fn create_job(&self, server: &ServerAccess, request: &CreateJobRequest) -> Result<String>;

    async fn cancel_job(&self, server: &ServerAccess, job_id: &str) -> Result<()>;

    async fn cancel_all(&self, server: &ServerAccess, device_id: &str) -> Result<()>;
}

/// reqwest implementation of [`JobApi`]
#[derive(Debug, Clone)]
pub struct OptimizeClient {
    client: Client,
}

impl OptimizeClient {
    /// Create a client with the default timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client whose requests are bounded by `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(headers)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self { client })
    }

    /// Build an authorized request for `path` relative to the server base
    fn request(&self, server: &ServerAccess, method: Method, path: &str) -> Result<(RequestBuilder, String)> {
        let (base, auth) = server.resolve()?;
        let url = base.join(path)?;
        let auth = HeaderValue::from_str(auth)
            .map_err(|e| OfflineError::configuration(format!("invalid authorization header: {}", e)))?;

        let endpoint = format!("/{}", path.split('?').next().unwrap_or(path));
        let builder = self.client.request(method, url).header(AUTHORIZATION, auth);
        Ok((builder, endpoint))
    }

    /// Send a request, mapping transport failures to transient errors
    async fn send(&self, builder: RequestBuilder, endpoint: &str) -> Result<Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::debug!(endpoint, "optimization server request timed out");
            }
            OfflineError::transient(format!("{} unreachable: {}", endpoint, e))
        })
    }

    async fn check_status(response: Response, endpoint: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(OfflineError::api_failed(
            format!("HTTP {}: {}", status.as_u16(), snippet),
            Some(status.as_u16()),
            Some(endpoint.to_string()),
        ))
    }

    async fn parse_json<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<T> {
        let body = response.bytes().await.map_err(|e| {
            OfflineError::transient(format!("{} body read failed: {}", endpoint, e))
        })?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// DELETE that treats 404 as already done
    async fn delete(&self, builder: RequestBuilder, endpoint: &str) -> Result<()> {
        let response = self.send(builder, endpoint).await?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(endpoint, "nothing to cancel on server");
            return Ok(());
        }
        Self::check_status(response, endpoint).await?;
        Ok(())
    }
}

#[async_trait]
impl JobApi for OptimizeClient {
    async fn list_jobs(&self, server: &ServerAccess, device_id: &str) -> Result<Vec<Job>> {
        if device_id.is_empty() {
            return Err(OfflineError::configuration("device id is not set"));
        }

        let (builder, endpoint) = self.request(server, Method::GET, "jobs")?;
        let response = self.send(builder.query(&[("deviceId", device_id)]), &endpoint).await?;
        let response = Self::check_status(response, &endpoint).await?;
        let jobs: Vec<Job> = Self::parse_json(response, &endpoint).await?;

        Ok(jobs.into_iter().map(Job::normalized).collect())
    }

    async fn create_job(&self, server: &ServerAccess, request: &CreateJobRequest) -> Result<String> {
        if request.device_id.is_empty() {
            return Err(OfflineError::configuration("device id is not set"));
        }

        let (builder, endpoint) = self.request(server, Method::POST, "optimize-version")?;
        let response = self.send(builder.json(request), &endpoint).await?;
        let response = Self::check_status(response, &endpoint).await?;
        let created: CreateJobResponse = Self::parse_json(response, &endpoint).await?;

        tracing::info!(job_id = %created.id, item_id = %request.item_id, "optimization job created");
        Ok(created.id)
    }

    async fn cancel_job(&self, server: &ServerAccess, job_id: &str) -> Result<()> {
        let path = format!("jobs/{}", urlencoding::encode(job_id));
        let (builder, endpoint) = self.request(server, Method::DELETE, &path)?;
        self.delete(builder, &endpoint).await
    }

    async fn cancel_all(&self, server: &ServerAccess, device_id: &str) -> Result<()> {
        if device_id.is_empty() {
            return Err(OfflineError::configuration("device id is not set"));
        }

        let (builder, endpoint) = self.request(server, Method::DELETE, "jobs")?;
        self.delete(builder.query(&[("deviceId", device_id)]), &endpoint).await
    }
}
