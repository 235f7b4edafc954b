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


//! Download orchestrator
//!
//! The one object the host talks to. It owns the job list, the completion
//! tracker, the local queue, the transfer manager and the catalog, and is the
//! only writer of each.
//!
//! # Flows
//! - **Remux**: [`DownloadOrchestrator::enqueue_remux`] puts the request on
//!   the local queue; when promoted, the entry runs a transfer of the direct
//!   stream URL and waits for it.
//! - **Optimized**: [`DownloadOrchestrator::enqueue_optimized`] creates a
//!   remote job. The poll loop reconciles the job list every tick; a job that
//!   completes is either started right away (auto-download) or announced with
//!   `JobReady`, once.
//!
//! # Tasks
//! - the poll loop, running while the app is in the foreground, the method is
//!   `optimized` and server URL and authorization are known
//! - the transfer event pump, applying transfer lifecycle to the job list
//! - the queue persister, writing `downloadQueue` on every queue change
//!
//! All three hold weak references; dropping the orchestrator ends them.
//!
//! # Usage Example
//! ```no_run
//! use offline_core::{DownloadOrchestrator, DownloadRequest, OptimizeClient, HttpTransferBackend};
//! use offline_core::config::OrchestratorSettings;
//! use offline_core::storage::{Database, SqliteKeyValueStore};
//! use offline_core::api::MediaItem;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = OrchestratorSettings::builder()
//!     .optimized_server_url("https://optimize.example.com")
//!     .download_directory("/data/downloads")
//!     .build()?;
//! let store = Arc::new(SqliteKeyValueStore::new(Database::new("/data/offline.db").await?));
//!
//! let orchestrator = DownloadOrchestrator::new(
//!     settings,
//!     store,
//!     Arc::new(OptimizeClient::new()?),
//!     Arc::new(HttpTransferBackend::new()?),
//!     Some("MediaBrowser Token=\"...\"".to_string()),
//! )
//! .await?;
//!
//! let mut events = orchestrator.subscribe();
//! orchestrator.set_foreground(true).await;
//!
//! let item = MediaItem::new("item-id", "Movie");
//! orchestrator
//!     .download(DownloadRequest::new(item, "https://media.example.com/stream".to_string()))
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let Some(text) = event.notification_text() {
//!         println!("{}", text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod request;

use crate::api::client::{JobApi, ServerAccess};
use crate::api::models::{CreateJobRequest, Job, JobStatus};
use crate::catalog::{DownloadDirectory, DownloadedItem, LocalCatalog, RemoveAllReport, RemoveOutcome};
use crate::config::OrchestratorSettings;
use crate::download::{
    JobQueue, QueueEntry, QueueSnapshot, TransferBackend, TransferEvent, TransferManager, TransferRequest,
};
use crate::error::{OfflineError, Result};
use crate::reconcile::{PollLoop, PollTarget, Reconciler};
use crate::storage::kv::{
    load_json_or_default, save_json, KeyValueStore, KEY_ACKNOWLEDGED_JOBS, KEY_DOWNLOAD_QUEUE,
};
use crate::storage::get_or_create_device_id;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

pub use events::OrchestratorEvent;
pub use request::{DownloadAction, DownloadRequest};

/// Capacity of the observer channel; slow observers lose the oldest events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long cancelled transfers get to leave the active set
const DRAIN_ATTEMPTS: u32 = 50;
const DRAIN_POLL: Duration = Duration::from_millis(10);

struct Inner {
    settings: RwLock<OrchestratorSettings>,
    authorization: RwLock<Option<String>>,
    device_id: String,

    store: Arc<dyn KeyValueStore>,
    api: Arc<dyn JobApi>,
    catalog: Arc<LocalCatalog>,
    transfers: TransferManager,
    queue: JobQueue,

    jobs: Mutex<Vec<Job>>,
    reconciler: Mutex<Reconciler>,
    /// Requests behind queued or active local entries, by item id
    requests: Mutex<HashMap<String, DownloadRequest>>,
    /// Items with a job creation in flight
    creating: StdMutex<HashSet<String>>,

    events: broadcast::Sender<OrchestratorEvent>,
}

/// Facade over queue, job API, reconciliation, transfers and catalog
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
    poll_loop: StdMutex<PollLoop>,
    foreground: AtomicBool,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl DownloadOrchestrator {
    /// Build the orchestrator and restore persisted state
    ///
    /// Loads (or creates) the device id, repairs the catalog against the
    /// download directory, loads the acknowledged job ids and re-queues local
    /// downloads that were pending when the process ended. Nothing polls
    /// until the host reports the foreground via [`set_foreground`](Self::set_foreground).
    pub async fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn JobApi>,
        backend: Arc<dyn TransferBackend>,
        authorization: Option<String>,
    ) -> Result<Self> {
        let settings = settings.validated()?;
        let device_id = get_or_create_device_id(store.as_ref()).await?;

        let directory = DownloadDirectory::new(settings.download_directory.clone());
        let catalog = Arc::new(LocalCatalog::open(Arc::clone(&store), directory).await?);
        if let Err(e) = catalog.verify().await {
            tracing::warn!(error = %e, "catalog verification failed");
        }

        let acknowledged: Vec<String> = load_json_or_default(store.as_ref(), KEY_ACKNOWLEDGED_JOBS).await?;
        let reconciler = Reconciler::new(acknowledged.into_iter().collect());

        let (transfers, transfer_rx) = TransferManager::new(backend, Arc::clone(&catalog));
        let queue = JobQueue::new(settings.concurrency_limit);
        let queue_rx = queue.subscribe();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let poll_loop = PollLoop::new(settings.poll_interval());

        let inner = Arc::new(Inner {
            settings: RwLock::new(settings),
            authorization: RwLock::new(authorization),
            device_id,
            store,
            api,
            catalog,
            transfers,
            queue,
            jobs: Mutex::new(Vec::new()),
            reconciler: Mutex::new(reconciler),
            requests: Mutex::new(HashMap::new()),
            creating: StdMutex::new(HashSet::new()),
            events,
        });

        let background = vec![
            tokio::spawn(Inner::pump_transfer_events(Arc::downgrade(&inner), transfer_rx)),
            tokio::spawn(Inner::persist_queue_changes(Arc::downgrade(&inner), queue_rx)),
        ];

        let pending: Vec<DownloadRequest> = load_json_or_default(inner.store.as_ref(), KEY_DOWNLOAD_QUEUE).await?;
        for request in pending {
            if inner.catalog.contains(request.item_id()).await {
                continue;
            }
            tracing::info!(item_id = %request.item_id(), "restoring queued download");
            inner.enqueue_local(request).await;
        }

        tracing::info!(device_id = %inner.device_id, "download orchestrator ready");
        Ok(Self {
            inner,
            poll_loop: StdMutex::new(poll_loop),
            foreground: AtomicBool::new(false),
            background: StdMutex::new(background),
        })
    }

    // ===== Observation =====

    /// Receive every event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Current job list
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.jobs.lock().await.clone()
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot().await
    }

    pub async fn downloaded_items(&self) -> Vec<DownloadedItem> {
        self.inner.catalog.list().await
    }

    pub async fn downloaded_item(&self, item_id: &str) -> Option<DownloadedItem> {
        self.inner.catalog.get(item_id).await
    }

    /// Total bytes of downloaded files
    pub async fn disk_usage(&self) -> u64 {
        self.inner.catalog.disk_usage().await
    }

    /// Job ids with a transfer in flight
    pub async fn active_transfers(&self) -> Vec<String> {
        self.inner.transfers.active_ids().await
    }

    pub fn is_polling(&self) -> bool {
        self.poll_loop.lock().map(|p| p.is_running()).unwrap_or(false)
    }

    pub async fn settings(&self) -> OrchestratorSettings {
        self.inner.settings.read().await.clone()
    }

    // ===== Downloads =====

    /// Download an item with the method selected in settings
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadAction> {
        if self.inner.catalog.contains(request.item_id()).await {
            return Ok(DownloadAction::AlreadyDownloaded {
                item_id: request.item_id().to_string(),
            });
        }

        if self.inner.settings.read().await.is_optimized() {
            let item_id = request.item_id().to_string();
            match self.enqueue_optimized(request).await? {
                Some(job_id) => Ok(DownloadAction::Optimizing { job_id }),
                None => Ok(DownloadAction::AlreadyDownloaded { item_id }),
            }
        } else {
            let item_id = request.item_id().to_string();
            let accepted = self.enqueue_remux(request).await?;
            Ok(DownloadAction::Queued { item_id, accepted })
        }
    }

    /// Queue a direct download of the stream URL
    ///
    /// Returns false if the item is already queued, active or downloaded.
    pub async fn enqueue_remux(&self, request: DownloadRequest) -> Result<bool> {
        if request.item_id().trim().is_empty() {
            return Err(OfflineError::MissingParameter("item id".to_string()));
        }
        if self.inner.authorization().await.is_none() {
            return Err(OfflineError::MissingParameter("authorization header".to_string()));
        }
        if self.inner.catalog.contains(request.item_id()).await {
            tracing::debug!(item_id = %request.item_id(), "already downloaded");
            return Ok(false);
        }

        Ok(self.inner.enqueue_local(request).await)
    }

    /// Ask the optimization server to transcode an item
    ///
    /// Returns the job id. If the item already has a live job, that job's id
    /// is returned and nothing is sent. Returns `None` without contacting the
    /// server if the item is already downloaded.
    pub async fn enqueue_optimized(&self, request: DownloadRequest) -> Result<Option<String>> {
        let inner = &self.inner;
        let item_id = request.item_id().to_string();
        if item_id.trim().is_empty() {
            return Err(OfflineError::MissingParameter("item id".to_string()));
        }

        let server = inner.server_access().await;
        server.resolve()?;

        if inner.catalog.contains(&item_id).await {
            tracing::debug!(item_id = %item_id, "already downloaded");
            return Ok(None);
        }

        if let Some(existing) = inner
            .jobs
            .lock()
            .await
            .iter()
            .find(|j| j.item.id == item_id && j.status != JobStatus::Failed)
        {
            tracing::debug!(job_id = %existing.id, item_id = %item_id, "item already has a job");
            return Ok(Some(existing.id.clone()));
        }
        if inner.queue.contains(&item_id).await {
            return Err(OfflineError::DuplicateJob(item_id));
        }

        let _guard = CreatingGuard::acquire(&inner.creating, &item_id)?;

        let mut create = CreateJobRequest::new(request.item.clone(), request.url.clone(), inner.device_id.clone());
        create.file_extension = request.file_extension.clone();

        let timeout = inner.settings.read().await.request_timeout();
        let job_id = with_timeout(timeout, inner.api.create_job(&server, &create)).await?;

        let snapshot = {
            let mut jobs = inner.jobs.lock().await;
            if !jobs.iter().any(|j| j.id == job_id) {
                let mut job = Job::optimizing(job_id.clone(), request.item);
                job.device_id = Some(inner.device_id.clone());
                jobs.push(job);
            }
            jobs.clone()
        };
        inner.emit(OrchestratorEvent::JobsUpdated(snapshot));

        Ok(Some(job_id))
    }

    /// Fetch the optimized file of a completed job
    ///
    /// The job is `Downloading` when this returns. Starting a job that is
    /// already downloading is a no-op.
    pub async fn start_transfer(&self, job_id: &str) -> Result<()> {
        self.inner.start_transfer(job_id).await
    }

    /// Cancel whatever runs under `id` (item id for local downloads, job id for optimized ones)
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let inner = &self.inner;

        let dequeued = inner.queue.remove(id).await;
        if dequeued {
            inner.requests.lock().await.remove(id);
        }

        // An active local entry waits on its transfer, so cancelling the
        // transfer ends the entry only after the transfer left the active set.
        // The queue is signalled directly only when no transfer runs yet.
        let transfer_cancelled = inner.transfers.cancel(id).await;
        if !dequeued && !transfer_cancelled {
            inner.queue.cancel(id).await;
        }

        let removed = {
            let mut jobs = inner.jobs.lock().await;
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            (jobs.len() != before).then(|| jobs.clone())
        };

        if let Some(snapshot) = removed {
            inner.emit(OrchestratorEvent::JobsUpdated(snapshot));
            let server = inner.server_access().await;
            let timeout = inner.settings.read().await.request_timeout();
            if let Err(e) = with_timeout(timeout, inner.api.cancel_job(&server, id)).await {
                tracing::warn!(job_id = id, error = %e, "remote cancel failed");
            }
        }

        tracing::info!(id, dequeued, transfer_cancelled, "cancel requested");
        Ok(())
    }

    // ===== Catalog =====

    /// Delete one downloaded item and its file
    pub async fn delete_download(&self, item_id: &str) -> Result<RemoveOutcome> {
        let outcome = self.inner.catalog.remove(item_id).await?;
        if outcome.record.is_some() {
            self.inner.emit(OrchestratorEvent::DownloadDeleted {
                item_id: item_id.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Delete every downloaded file, clear the catalog and cancel all remote jobs
    ///
    /// All phases run even if one fails; a failed phase turns the result into
    /// `PartialFailure`.
    pub async fn delete_all_downloads(&self) -> Result<RemoveAllReport> {
        let inner = &self.inner;

        // Queued entries go first so no cancelled slot promotes new work
        inner.queue.clear().await;
        inner.requests.lock().await.clear();
        inner.transfers.cancel_all().await;
        inner.drain_transfers().await;

        let server = inner.server_access().await;
        let timeout = inner.settings.read().await.request_timeout();
        let api = Arc::clone(&inner.api);
        let device_id = inner.device_id.clone();

        let report = inner
            .catalog
            .remove_all(|| async move { with_timeout(timeout, api.cancel_all(&server, &device_id)).await })
            .await;

        if report.remote_error.is_none() {
            inner.jobs.lock().await.clear();
            inner.emit(OrchestratorEvent::JobsUpdated(Vec::new()));
        }

        inner.emit(OrchestratorEvent::AllFilesDeleted {
            files_deleted: report.files_deleted,
            complete: report.is_complete(),
        });

        report.into_result()
    }

    // ===== Lifecycle & settings =====

    /// Report app foreground state; polling only runs in the foreground
    pub async fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
        self.refresh_polling().await;
    }

    /// Apply new settings from the settings screen
    ///
    /// The download directory is fixed for the lifetime of the orchestrator.
    pub async fn update_settings(&self, settings: OrchestratorSettings) -> Result<()> {
        let settings = settings.validated()?;

        let interval_changed = {
            let mut current = self.inner.settings.write().await;
            if current.download_directory != settings.download_directory {
                tracing::warn!("download directory change applies after restart");
            }
            let changed = current.poll_interval() != settings.poll_interval();
            let directory = current.download_directory.clone();
            *current = settings;
            current.download_directory = directory;
            changed
        };

        let limit = self.inner.settings.read().await.concurrency_limit;
        self.inner.queue.set_concurrency_limit(limit).await;

        if interval_changed {
            let interval = self.inner.settings.read().await.poll_interval();
            if let Ok(mut poll_loop) = self.poll_loop.lock() {
                poll_loop.stop();
                *poll_loop = PollLoop::new(interval);
            }
        }

        self.refresh_polling().await;
        Ok(())
    }

    /// Set or clear the `Authorization` header value
    pub async fn set_authorization(&self, authorization: Option<String>) {
        *self.inner.authorization.write().await = authorization.filter(|a| !a.trim().is_empty());
        self.refresh_polling().await;
    }

    /// Run one reconciliation pass now and return the new job list
    pub async fn reconcile_now(&self) -> Result<Vec<Job>> {
        self.inner.poll_once().await?;
        Ok(self.jobs().await)
    }

    /// Stop polling, cancel transfers and end background tasks
    ///
    /// The persisted queue keeps every entry that was queued or active, so
    /// the next start resumes them.
    pub async fn shutdown(&self) {
        if let Ok(poll_loop) = self.poll_loop.lock() {
            poll_loop.stop();
        }

        // Persister first: the cancellations below must not reach `downloadQueue`
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }

        let dropped = self.inner.queue.close().await;
        let cancelled = self.inner.transfers.cancel_all().await;
        self.inner.drain_transfers().await;

        tracing::info!(cancelled, queued = dropped.len(), "download orchestrator shut down");
    }

    async fn refresh_polling(&self) {
        let should_poll = self.foreground.load(Ordering::SeqCst)
            && self.inner.settings.read().await.is_optimized()
            && self.inner.server_access().await.is_complete();

        let target: Weak<dyn PollTarget> = Arc::downgrade(&self.inner) as Weak<dyn PollTarget>;
        if let Ok(poll_loop) = self.poll_loop.lock() {
            match (should_poll, poll_loop.is_running()) {
                (true, false) => {
                    poll_loop.start(target);
                }
                (false, true) => {
                    poll_loop.stop();
                }
                _ => {}
            }
        }
    }
}

impl Drop for DownloadOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut background) = self.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn emit(&self, event: OrchestratorEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn authorization(&self) -> Option<String> {
        self.authorization.read().await.clone()
    }

    async fn server_access(&self) -> ServerAccess {
        ServerAccess::new(
            self.settings.read().await.optimized_server_url.clone(),
            self.authorization().await,
        )
    }

    /// Let cancelled transfers clean up their partial files
    async fn drain_transfers(&self) {
        for _ in 0..DRAIN_ATTEMPTS {
            if self.transfers.active_count().await == 0 {
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        tracing::warn!(
            active = self.transfers.active_count().await,
            "transfers still running after cancel"
        );
    }

    async fn persist_acknowledged(&self) {
        let ids = self.reconciler.lock().await.acknowledged_ids();
        if let Err(e) = save_json(self.store.as_ref(), KEY_ACKNOWLEDGED_JOBS, &ids).await {
            tracing::warn!(error = %e, "could not persist acknowledged jobs");
        }
    }

    /// Put a request on the local queue
    async fn enqueue_local(self: &Arc<Self>, request: DownloadRequest) -> bool {
        let item = request.item.clone();
        let item_id = item.id.clone();
        self.requests.lock().await.insert(item_id.clone(), request);

        let weak = Arc::downgrade(self);
        let entry_id = item_id.clone();
        let entry = QueueEntry::new(item, move || async move {
            let Some(inner) = weak.upgrade() else {
                return Err(OfflineError::Cancelled);
            };
            let result = inner.run_local(&entry_id).await;
            inner.requests.lock().await.remove(&entry_id);
            result
        });

        let accepted = self.queue.enqueue(entry).await;
        if !accepted && self.queue.is_closed().await {
            self.requests.lock().await.remove(&item_id);
        }
        accepted
    }

    /// Body of a local queue entry: transfer the stream and wait for it
    async fn run_local(&self, item_id: &str) -> Result<()> {
        let request = self
            .requests
            .lock()
            .await
            .get(item_id)
            .cloned()
            .ok_or_else(|| OfflineError::RecordNotFound(item_id.to_string()))?;

        let authorization = self
            .authorization()
            .await
            .ok_or_else(|| OfflineError::MissingParameter("authorization header".to_string()))?;

        let transfer = TransferRequest::new(item_id, request.item, request.url, authorization)
            .with_media_source(request.media_source)
            .with_extension(request.file_extension);

        let handle = self.transfers.start(transfer).await?;
        handle.wait().await.map(|_| ())
    }

    async fn start_transfer(&self, job_id: &str) -> Result<()> {
        let server = self.server_access().await;
        let (_, authorization) = server.resolve()?;
        let authorization = authorization.to_string();
        let url = server.download_url(job_id)?;

        let mut jobs = self.jobs.lock().await;
        let Some(index) = jobs.iter().position(|j| j.id == job_id) else {
            return Err(OfflineError::RecordNotFound(job_id.to_string()));
        };

        if jobs[index].status == JobStatus::Downloading || self.transfers.is_active(job_id).await {
            tracing::debug!(job_id, "transfer already running");
            return Ok(());
        }

        let job = jobs[index].clone();
        let extension = job
            .output_path
            .as_deref()
            .and_then(|p| std::path::Path::new(p).extension())
            .and_then(|e| e.to_str())
            .unwrap_or("mp4")
            .to_string();
        let request = TransferRequest::new(job_id, job.item.clone(), url, authorization).with_extension(extension);

        let previous_status = job.status;
        jobs[index].status = JobStatus::Downloading;
        jobs[index].progress = 0.0;

        match self.transfers.start(request).await {
            Ok(_) => {
                self.emit(OrchestratorEvent::JobsUpdated(jobs.clone()));
                Ok(())
            }
            Err(OfflineError::DuplicateJob(_)) => Ok(()),
            Err(e) => {
                jobs[index].status = previous_status;
                Err(e)
            }
        }
    }

    /// One reconciliation pass
    async fn poll_once(&self) -> Result<()> {
        let server = self.server_access().await;
        server.resolve()?;
        let (timeout, auto_download) = {
            let settings = self.settings.read().await;
            (settings.request_timeout(), settings.auto_download)
        };

        let remote = with_timeout(timeout, self.api.list_jobs(&server, &self.device_id)).await?;

        let downloaded: HashSet<String> = self
            .catalog
            .list()
            .await
            .into_iter()
            .map(|d| d.item.id)
            .collect();

        let outcome = {
            let mut jobs = self.jobs.lock().await;
            let mut reconciler = self.reconciler.lock().await;
            let outcome = reconciler.apply(&jobs, &remote, |item_id| downloaded.contains(item_id));
            if outcome.changed {
                *jobs = outcome.jobs.clone();
            }
            outcome
        };

        if outcome.changed {
            self.emit(OrchestratorEvent::JobsUpdated(outcome.jobs));
        }
        if outcome.acknowledged_changed {
            self.persist_acknowledged().await;
        }

        for job in outcome.ready {
            if auto_download {
                tracing::info!(job_id = %job.id, "job completed, starting download");
                if let Err(e) = self.start_transfer(&job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "auto-download failed to start");
                }
            } else {
                tracing::info!(job_id = %job.id, "job ready for download");
                self.emit(OrchestratorEvent::JobReady {
                    job_id: job.id,
                    item: job.item,
                });
            }
        }

        Ok(())
    }

    /// Apply transfer lifecycle to the job list and forward it to observers
    async fn pump_transfer_events(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<TransferEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.handle_transfer_event(event).await;
        }
    }

    async fn handle_transfer_event(self: &Arc<Self>, event: TransferEvent) {
        match event {
            TransferEvent::Started { job_id, item_id } => {
                self.emit(OrchestratorEvent::DownloadStarted { job_id, item_id });
            }
            TransferEvent::Progress(progress) => {
                if let Some(job) = self.jobs.lock().await.iter_mut().find(|j| j.id == progress.job_id) {
                    job.progress = progress.percent;
                    job.speed = Some(progress.speed);
                }
                self.emit(OrchestratorEvent::Progress(progress));
            }
            TransferEvent::Completed { job_id, downloaded } => {
                let removed = {
                    let mut jobs = self.jobs.lock().await;
                    let before = jobs.len();
                    jobs.retain(|j| j.id != job_id);
                    (jobs.len() != before).then(|| jobs.clone())
                };

                if let Some(snapshot) = removed {
                    self.emit(OrchestratorEvent::JobsUpdated(snapshot));
                    self.reconciler.lock().await.acknowledge(&job_id);
                    self.persist_acknowledged().await;

                    // Server copy is no longer needed
                    let inner = Arc::clone(self);
                    let remote_id = job_id.clone();
                    tokio::spawn(async move {
                        let server = inner.server_access().await;
                        let timeout = inner.settings.read().await.request_timeout();
                        if let Err(e) = with_timeout(timeout, inner.api.cancel_job(&server, &remote_id)).await {
                            tracing::debug!(job_id = %remote_id, error = %e, "server cleanup failed");
                        }
                    });
                }

                self.emit(OrchestratorEvent::DownloadFinished { job_id, downloaded });
            }
            TransferEvent::Failed {
                job_id,
                item_id,
                kind,
                message,
            } => {
                self.set_job_status(&job_id, JobStatus::Failed).await;
                self.emit(OrchestratorEvent::DownloadFailed {
                    job_id,
                    item_id,
                    kind,
                    message,
                });
            }
            TransferEvent::Cancelled { job_id, item_id } => {
                self.set_job_status(&job_id, JobStatus::Completed).await;
                self.emit(OrchestratorEvent::DownloadCancelled { job_id, item_id });
            }
        }
    }

    async fn set_job_status(&self, job_id: &str, status: JobStatus) {
        let snapshot = {
            let mut jobs = self.jobs.lock().await;
            match jobs.iter_mut().find(|j| j.id == job_id) {
                Some(job) => {
                    job.status = status;
                    Some(jobs.clone())
                }
                None => None,
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(OrchestratorEvent::JobsUpdated(snapshot));
        }
    }

    /// Write `downloadQueue` on every queue change
    async fn persist_queue_changes(weak: Weak<Inner>, mut rx: watch::Receiver<QueueSnapshot>) {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            let Some(inner) = weak.upgrade() else {
                break;
            };

            let pending: Vec<DownloadRequest> = {
                let requests = inner.requests.lock().await;
                snapshot
                    .active
                    .iter()
                    .chain(snapshot.queued.iter())
                    .filter_map(|item| requests.get(&item.id).cloned())
                    .collect()
            };

            if let Err(e) = save_json(inner.store.as_ref(), KEY_DOWNLOAD_QUEUE, &pending).await {
                tracing::warn!(error = %e, "could not persist download queue");
            }
            inner.emit(OrchestratorEvent::QueueChanged(snapshot));
        }
    }
}

#[async_trait]
impl PollTarget for Inner {
    async fn poll(&self) -> Result<()> {
        self.poll_once().await
    }
}

/// Marks an item as having a job creation in flight
struct CreatingGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    item_id: String,
}

impl<'a> CreatingGuard<'a> {
    fn acquire(set: &'a StdMutex<HashSet<String>>, item_id: &str) -> Result<Self> {
        let mut creating = set
            .lock()
            .map_err(|_| OfflineError::InvalidState("job creation state poisoned".to_string()))?;
        if !creating.insert(item_id.to_string()) {
            return Err(OfflineError::DuplicateJob(item_id.to_string()));
        }
        Ok(Self {
            set,
            item_id: item_id.to_string(),
        })
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut creating) = self.set.lock() {
            creating.remove(&self.item_id);
        }
    }
}

/// Bound a job API call by the request timeout
async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| OfflineError::Timeout(timeout.as_secs().max(1)))?
}
