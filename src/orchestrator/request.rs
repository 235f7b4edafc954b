use crate::api::models::{MediaItem, MediaSource};
use serde::{Deserialize, Serialize};

/// What the UI hands over to download one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub item: MediaItem,
    pub media_source: MediaSource,
    /// Direct (remux) stream URL on the media server
    pub url: String,
    #[serde(default = "default_extension")]
    pub file_extension: String,
}

fn default_extension() -> String {
    "mp4".to_string()
}

impl DownloadRequest {
    pub fn new(item: MediaItem, url: String) -> Self {
        Self {
            media_source: item.primary_source(),
            item,
            url,
            file_extension: default_extension(),
        }
    }

    pub fn with_media_source(mut self, source: MediaSource) -> Self {
        self.media_source = source;
        self
    }

    pub fn with_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.file_extension = extension.into();
        self
    }

    pub fn item_id(&self) -> &str {
        &self.item.id
    }
}

/// How [`DownloadOrchestrator::download`](super::DownloadOrchestrator::download) handled a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadAction {
    /// Added to the local queue; `accepted` is false if it was already there
    Queued { item_id: String, accepted: bool },
    /// Sent to the optimization server
    Optimizing { job_id: String },
    /// Already in the catalog; nothing was queued or sent
    AlreadyDownloaded { item_id: String },
}
