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


//! Transfer manager
//!
//! Runs one task per transfer, keyed by job id. Each task streams through the
//! [`TransferBackend`] into `{itemId}.{ext}.part`, renames the file into place
//! and records it in the catalog. Lifecycle events go out over an unbounded
//! channel; callers that want the outcome of one transfer await its
//! [`TransferHandle`].
//!
//! # Lifecycle
//! `Started` is sent before `start` returns. Exactly one of `Completed`,
//! `Failed` or `Cancelled` follows, after the transfer has left the active set.
//! Failures are never retried here.

use crate::api::models::{MediaItem, MediaSource};
use crate::catalog::{DownloadDirectory, DownloadedItem, LocalCatalog};
use crate::download::backend::{FetchRequest, TransferBackend};
use crate::download::progress::{ProgressTracker, TransferProgress};
use crate::error::{OfflineError, Result, TransferErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

/// Everything needed to fetch one file
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub job_id: String,
    pub item: MediaItem,
    pub media_source: MediaSource,
    pub url: String,
    /// Sent with the request; must carry `Authorization`
    pub headers: Vec<(String, String)>,
    pub file_extension: String,
}

impl TransferRequest {
    /// Request with the item's primary source and an `mp4` extension
    pub fn new<S: Into<String>>(job_id: S, item: MediaItem, url: String, authorization: String) -> Self {
        Self {
            job_id: job_id.into(),
            media_source: item.primary_source(),
            item,
            url,
            headers: vec![("Authorization".to_string(), authorization)],
            file_extension: "mp4".to_string(),
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

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(OfflineError::MissingParameter("job id".to_string()));
        }
        if self.item.id.trim().is_empty() {
            return Err(OfflineError::MissingParameter("item id".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(OfflineError::MissingParameter("url".to_string()));
        }
        if self.authorization().is_none() {
            return Err(OfflineError::MissingParameter("authorization header".to_string()));
        }
        Ok(())
    }
}

/// Lifecycle notification of a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        job_id: String,
        item_id: String,
    },
    Progress(TransferProgress),
    Completed {
        job_id: String,
        downloaded: DownloadedItem,
    },
    Failed {
        job_id: String,
        item_id: String,
        kind: TransferErrorKind,
        /// User-facing message
        message: String,
    },
    Cancelled {
        job_id: String,
        item_id: String,
    },
}

impl TransferEvent {
    pub fn job_id(&self) -> &str {
        match self {
            TransferEvent::Started { job_id, .. }
            | TransferEvent::Completed { job_id, .. }
            | TransferEvent::Failed { job_id, .. }
            | TransferEvent::Cancelled { job_id, .. } => job_id,
            TransferEvent::Progress(p) => &p.job_id,
        }
    }

    /// True for `Completed`, `Failed` and `Cancelled`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. } | TransferEvent::Failed { .. } | TransferEvent::Cancelled { .. }
        )
    }
}

/// Completion handle of one transfer
#[derive(Debug)]
pub struct TransferHandle {
    job_id: String,
    done: oneshot::Receiver<Result<DownloadedItem>>,
}

impl TransferHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the transfer to finish
    pub async fn wait(self) -> Result<DownloadedItem> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(OfflineError::Cancelled),
        }
    }
}

struct ActiveTransfer {
    item_id: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Runs transfers and keeps the set of active ones
pub struct TransferManager {
    backend: Arc<dyn TransferBackend>,
    catalog: Arc<LocalCatalog>,
    active: Arc<RwLock<HashMap<String, ActiveTransfer>>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferManager {
    /// Create a manager and the receiving end of its event channel
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        catalog: Arc<LocalCatalog>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            backend,
            catalog,
            active: Arc::new(RwLock::new(HashMap::new())),
            events,
        };
        (manager, rx)
    }

    /// Start a transfer
    ///
    /// # Errors
    /// - `MissingParameter` without item id, URL or authorization header
    /// - `DuplicateJob` if the job, or another job for the same item, is active
    pub async fn start(&self, request: TransferRequest) -> Result<TransferHandle> {
        request.validate()?;

        let mut active = self.active.write().await;
        if active.contains_key(&request.job_id) {
            return Err(OfflineError::DuplicateJob(request.job_id));
        }
        if active.values().any(|t| t.item_id == request.item.id) {
            return Err(OfflineError::DuplicateJob(request.item.id));
        }

        let job_id = request.job_id.clone();
        let item_id = request.item.id.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tracing::info!(job_id = %job_id, item_id = %item_id, "transfer started");
        let _ = self.events.send(TransferEvent::Started {
            job_id: job_id.clone(),
            item_id: item_id.clone(),
        });

        let backend = Arc::clone(&self.backend);
        let catalog = Arc::clone(&self.catalog);
        let events = self.events.clone();
        let active_map = Arc::clone(&self.active);

        // The write lock is held until the entry is inserted, so the task's
        // own removal can't run first.
        let handle = tokio::spawn(async move {
            let job_id = request.job_id.clone();
            let item_id = request.item.id.clone();

            let result = Self::run(backend, catalog, request, events.clone(), cancel_rx).await;

            active_map.write().await.remove(&job_id);

            let event = match &result {
                Ok(downloaded) => {
                    tracing::info!(job_id = %job_id, path = %downloaded.file_path.display(), "transfer completed");
                    TransferEvent::Completed {
                        job_id: job_id.clone(),
                        downloaded: downloaded.clone(),
                    }
                }
                Err(OfflineError::Cancelled) => {
                    tracing::info!(job_id = %job_id, "transfer cancelled");
                    TransferEvent::Cancelled {
                        job_id: job_id.clone(),
                        item_id,
                    }
                }
                Err(e) => {
                    let kind = e.transfer_kind();
                    tracing::error!(job_id = %job_id, kind = %kind, error = %e, "transfer failed");
                    TransferEvent::Failed {
                        job_id: job_id.clone(),
                        item_id,
                        kind,
                        message: kind.user_message().to_string(),
                    }
                }
            };

            let _ = events.send(event);
            let _ = done_tx.send(result);
        });

        active.insert(
            job_id.clone(),
            ActiveTransfer {
                item_id,
                cancel_tx: Some(cancel_tx),
                handle,
            },
        );

        Ok(TransferHandle { job_id, done: done_rx })
    }

    async fn run(
        backend: Arc<dyn TransferBackend>,
        catalog: Arc<LocalCatalog>,
        request: TransferRequest,
        events: mpsc::UnboundedSender<TransferEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> Result<DownloadedItem> {
        let directory = catalog.directory().clone();
        let destination = directory.file_path(&request.item.id, &request.file_extension);
        let part = DownloadDirectory::part_path(&destination);
        directory.ensure_exists().await?;

        let tracker = StdMutex::new(ProgressTracker::new(request.job_id.clone(), request.item.id.clone()));
        let report = |bytes: u64, total: Option<u64>| {
            if let Ok(mut tracker) = tracker.lock() {
                tracker.set_total(total);
                if tracker.update(bytes) {
                    let _ = events.send(TransferEvent::Progress(tracker.snapshot()));
                }
            }
        };

        let fetch = FetchRequest {
            url: request.url.clone(),
            headers: request.headers.clone(),
        };

        let fetched = tokio::select! {
            result = backend.fetch(&fetch, &part, &report) => result,
            _ = &mut cancel_rx => Err(OfflineError::Cancelled),
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = directory.safe_delete(&part).await {
                    tracing::warn!(path = %part.display(), error = %cleanup, "could not remove partial file");
                }
                return Err(e);
            }
        };

        // A cancel that arrived after the last byte still wins
        if cancel_rx.try_recv().is_ok() {
            let _ = directory.safe_delete(&part).await;
            return Err(OfflineError::Cancelled);
        }

        if let Ok(mut tracker) = tracker.lock() {
            let _ = events.send(TransferEvent::Progress(tracker.finish(bytes)));
        }

        let mut downloaded = DownloadedItem::new(request.item, request.media_source, destination);
        downloaded.size = Some(bytes);

        if let Err(e) = catalog.commit(&part, downloaded.clone()).await {
            let _ = directory.safe_delete(&part).await;
            return Err(OfflineError::transfer(
                e.transfer_kind(),
                format!("could not store download: {}", e),
            ));
        }

        Ok(downloaded)
    }

    /// Signal an active transfer to stop
    ///
    /// Returns false if the job is not active. The `Cancelled` event follows
    /// once the task has cleaned up.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut active = self.active.write().await;
        match active.get_mut(job_id).and_then(|t| t.cancel_tx.take()) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Signal every active transfer to stop
    pub async fn cancel_all(&self) -> usize {
        let mut active = self.active.write().await;
        active
            .values_mut()
            .filter_map(|t| t.cancel_tx.take())
            .map(|tx| tx.send(()))
            .filter(|r| r.is_ok())
            .count()
    }

    pub async fn is_active(&self, job_id: &str) -> bool {
        self.active.read().await.contains_key(job_id)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }
}
