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


//! Wire models shared by the job API, the transfer manager and the catalog
//!
//! `MediaItem` and `MediaSource` mirror the media server's PascalCase JSON.
//! Only the fields the orchestrator reads are typed; everything else is kept
//! in `extra` so items round-trip unchanged into the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reference metadata for a media item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaItem {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time_ticks: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_sources: Vec<MediaSource>,

    /// Server fields the core does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaItem {
    pub fn new<I: Into<String>, N: Into<String>>(id: I, name: N) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            item_type: None,
            container: None,
            series_name: None,
            run_time_ticks: None,
            media_sources: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Name shown in notifications ("Series - Episode" for episodes)
    pub fn display_name(&self) -> String {
        match self.series_name.as_deref() {
            Some(series) if !series.is_empty() => format!("{} - {}", series, self.name),
            _ => self.name.clone(),
        }
    }

    /// First media source, or a bare one derived from the item itself
    pub fn primary_source(&self) -> MediaSource {
        self.media_sources.first().cloned().unwrap_or_else(|| MediaSource {
            id: self.id.clone(),
            container: self.container.clone(),
            ..MediaSource::default()
        })
    }
}

/// One playable version of a media item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaSource {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status of a remote optimization job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "queued", alias = "pending")]
    Optimizing,
    Downloading,
    Completed,
    #[serde(alias = "cancelled")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Optimizing => "optimizing",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A unit of remote optimization work, as reported by `GET /jobs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub item: MediaItem,
    pub status: JobStatus,

    /// Percentage in [0, 100]
    #[serde(default)]
    pub progress: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Job {
    /// Job as first known locally, right after `POST /optimize-version`
    pub fn optimizing<S: Into<String>>(id: S, item: MediaItem) -> Self {
        Self {
            id: id.into(),
            item_id: Some(item.id.clone()),
            item,
            status: JobStatus::Optimizing,
            progress: 0.0,
            speed: None,
            device_id: None,
            input_url: None,
            output_path: None,
            timestamp: Some(Utc::now()),
            size: None,
        }
    }

    /// Clamp progress into [0, 100]; servers occasionally report overshoot
    pub fn normalized(mut self) -> Self {
        if !self.progress.is_finite() {
            self.progress = 0.0;
        }
        self.progress = self.progress.clamp(0.0, 100.0);
        self
    }
}

/// Body of `POST /optimize-version`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    /// Stream URL the optimization server transcodes from
    pub url: String,
    pub file_extension: String,
    pub device_id: String,
    pub item_id: String,
    pub item: MediaItem,
}

impl CreateJobRequest {
    pub fn new(item: MediaItem, url: String, device_id: String) -> Self {
        Self {
            url,
            file_extension: "mp4".to_string(),
            device_id,
            item_id: item.id.clone(),
            item,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateJobResponse {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_deserializes_server_payload() {
        let json = r#"{
            "id": "job-1",
            "status": "queued",
            "progress": 12.5,
            "deviceId": "dev",
            "itemId": "item-1",
            "item": { "Id": "item-1", "Name": "Pilot", "SeriesName": "Show", "Type": "Episode", "UserData": { "Played": false } },
            "speed": 1.5,
            "timestamp": "2024-05-01T10:00:00Z"
        }"#;

        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.status, JobStatus::Optimizing);
        assert_eq!(job.item.display_name(), "Show - Pilot");
        assert_eq!(job.item.item_type.as_deref(), Some("Episode"));
        assert!(job.item.extra.contains_key("UserData"));

        let back = serde_json::to_value(&job.item).unwrap();
        assert_eq!(back["UserData"]["Played"], Value::Bool(false));
    }

    #[test]
    fn test_cancelled_reads_as_failed() {
        let status: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(status.is_terminal());
    }

    #[test]
    fn test_progress_normalized() {
        let mut job = Job::optimizing("j", MediaItem::new("i", "n"));
        job.progress = 104.0;
        assert_eq!(job.normalized().progress, 100.0);
    }

    #[test]
    fn test_primary_source_falls_back_to_item() {
        let mut item = MediaItem::new("abc", "Movie");
        item.container = Some("mkv".to_string());
        let source = item.primary_source();
        assert_eq!(source.id, "abc");
        assert_eq!(source.container.as_deref(), Some("mkv"));
    }
}
