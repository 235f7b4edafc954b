//! Events published to observers of the orchestrator

use crate::api::models::{Job, MediaItem};
use crate::catalog::DownloadedItem;
use crate::download::{QueueSnapshot, TransferProgress};
use crate::error::TransferErrorKind;

/// Everything an observer (UI, notifications, CLI) can react to
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// The job list changed
    JobsUpdated(Vec<Job>),

    /// Throttled transfer progress
    Progress(TransferProgress),

    /// The local queue changed
    QueueChanged(QueueSnapshot),

    /// An optimized job finished on the server and waits for the user
    JobReady { job_id: String, item: MediaItem },

    DownloadStarted { job_id: String, item_id: String },

    DownloadFinished { job_id: String, downloaded: DownloadedItem },

    DownloadFailed {
        job_id: String,
        item_id: String,
        kind: TransferErrorKind,
        message: String,
    },

    DownloadCancelled { job_id: String, item_id: String },

    /// One downloaded item was deleted
    DownloadDeleted { item_id: String },

    /// Bulk delete finished; `complete` is false if a phase failed
    AllFilesDeleted { files_deleted: usize, complete: bool },
}

impl OrchestratorEvent {
    /// Events that warrant a user-visible notification
    pub fn is_user_notification(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::JobReady { .. }
                | OrchestratorEvent::DownloadStarted { .. }
                | OrchestratorEvent::DownloadFinished { .. }
                | OrchestratorEvent::DownloadFailed { .. }
                | OrchestratorEvent::AllFilesDeleted { .. }
        )
    }

    /// Short text for a notification, if this event is one
    pub fn notification_text(&self) -> Option<String> {
        match self {
            OrchestratorEvent::JobReady { item, .. } => {
                Some(format!("{} is ready to be downloaded", item.display_name()))
            }
            OrchestratorEvent::DownloadStarted { .. } => Some("Download started".to_string()),
            OrchestratorEvent::DownloadFinished { downloaded, .. } => {
                Some(format!("{} downloaded", downloaded.item.display_name()))
            }
            OrchestratorEvent::DownloadFailed { message, .. } => Some(message.clone()),
            OrchestratorEvent::AllFilesDeleted { complete: true, .. } => {
                Some("All downloads deleted".to_string())
            }
            OrchestratorEvent::AllFilesDeleted { complete: false, .. } => {
                Some("Some downloads could not be deleted".to_string())
            }
            _ => None,
        }
    }
}
