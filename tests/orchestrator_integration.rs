//! Integration tests for DownloadOrchestrator
//!
//! Runs the orchestrator end to end against an in-memory job server and a
//! transfer backend that writes fixed bytes, with a real SQLite store and a
//! temporary download directory.

use async_trait::async_trait;
use offline_core::api::{CreateJobRequest, Job, JobApi, JobStatus, MediaItem, ServerAccess};
use offline_core::config::{DownloadMethod, OrchestratorSettings};
use offline_core::download::backend::ProgressFn;
use offline_core::download::{FetchRequest, TransferBackend};
use offline_core::storage::kv::{KeyValueStore, KEY_DOWNLOAD_QUEUE};
use offline_core::storage::{Database, SqliteKeyValueStore};
use offline_core::{
    DownloadAction, DownloadOrchestrator, DownloadRequest, OfflineError, OrchestratorEvent, Result,
    TransferErrorKind,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, Semaphore};

const SERVER_URL: &str = "http://optimize.test";
const AUTH: &str = "MediaBrowser Token=\"test\"";
const PAYLOAD: &[u8] = b"offline payload";

/// Job server that keeps its job list in memory
#[derive(Default)]
struct FakeJobApi {
    jobs: Mutex<Vec<Job>>,
    created: AtomicUsize,
    listed: AtomicUsize,
    cancelled: Mutex<Vec<String>>,
    cancel_all_calls: AtomicUsize,
}

impl FakeJobApi {
    fn set_status(&self, job_id: &str, status: JobStatus) {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.iter_mut().find(|j| j.id == job_id).unwrap();
        job.status = status;
        if status == JobStatus::Completed {
            job.progress = 100.0;
        }
    }

    fn insert(&self, job: Job) {
        self.jobs.lock().unwrap().push(job);
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobApi for FakeJobApi {
    async fn list_jobs(&self, server: &ServerAccess, device_id: &str) -> Result<Vec<Job>> {
        server.resolve()?;
        self.listed.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.device_id.as_deref() == Some(device_id))
            .cloned()
            .collect())
    }

    async fn create_job(&self, server: &ServerAccess, request: &CreateJobRequest) -> Result<String> {
        server.resolve()?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("job-{}", n);

        let mut job = Job::optimizing(id.clone(), request.item.clone());
        job.device_id = Some(request.device_id.clone());
        job.timestamp = None;
        self.insert(job);
        Ok(id)
    }

    async fn cancel_job(&self, server: &ServerAccess, job_id: &str) -> Result<()> {
        server.resolve()?;
        self.cancelled.lock().unwrap().push(job_id.to_string());
        self.jobs.lock().unwrap().retain(|j| j.id != job_id);
        Ok(())
    }

    async fn cancel_all(&self, server: &ServerAccess, device_id: &str) -> Result<()> {
        server.resolve()?;
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .lock()
            .unwrap()
            .retain(|j| j.device_id.as_deref() != Some(device_id));
        Ok(())
    }
}

/// Backend that records every fetch and optionally holds it until released
#[derive(Default)]
struct FakeBackend {
    gate: Option<Semaphore>,
    failures: Mutex<HashMap<String, TransferErrorKind>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    fn release(&self, transfers: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(transfers);
        }
    }

    fn fail(&self, url: &str, kind: TransferErrorKind) {
        self.failures.lock().unwrap().insert(url.to_string(), kind);
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferBackend for FakeBackend {
    async fn fetch(&self, request: &FetchRequest, destination: &Path, progress: ProgressFn<'_>) -> Result<u64> {
        self.fetched.lock().unwrap().push(request.url.clone());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let failure = self.failures.lock().unwrap().get(&request.url).copied();
        if let Some(kind) = failure {
            tokio::fs::write(destination, &PAYLOAD[..4]).await?;
            return Err(OfflineError::transfer(kind, "simulated failure"));
        }

        tokio::fs::write(destination, PAYLOAD).await?;
        progress(PAYLOAD.len() as u64, Some(PAYLOAD.len() as u64));
        Ok(PAYLOAD.len() as u64)
    }
}

struct Harness {
    _temp: TempDir,
    downloads: PathBuf,
    store: Arc<dyn KeyValueStore>,
    api: Arc<FakeJobApi>,
    backend: Arc<FakeBackend>,
    orchestrator: DownloadOrchestrator,
}

fn settings(method: DownloadMethod, concurrency: usize, auto_download: bool) -> OrchestratorSettings {
    OrchestratorSettings::builder()
        .optimized_server_url(SERVER_URL)
        .download_method(method)
        .concurrency_limit(concurrency)
        .auto_download(auto_download)
        .build()
        .unwrap()
}

async fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(SqliteKeyValueStore::new(Database::new_in_memory().await.unwrap()))
}

async fn harness_with(
    mut settings: OrchestratorSettings,
    store: Arc<dyn KeyValueStore>,
    api: Arc<FakeJobApi>,
    backend: FakeBackend,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let downloads = temp.path().join("downloads");
    settings.download_directory = downloads.clone();

    let backend = Arc::new(backend);
    let orchestrator = DownloadOrchestrator::new(
        settings,
        Arc::clone(&store),
        api.clone(),
        backend.clone(),
        Some(AUTH.to_string()),
    )
    .await
    .unwrap();

    Harness {
        _temp: temp,
        downloads,
        store,
        api,
        backend,
        orchestrator,
    }
}

async fn harness(settings: OrchestratorSettings, backend: FakeBackend) -> Harness {
    harness_with(settings, memory_store().await, Arc::new(FakeJobApi::default()), backend).await
}

fn request(item_id: &str) -> DownloadRequest {
    DownloadRequest::new(
        MediaItem::new(item_id, format!("Title {}", item_id)),
        format!("http://media.test/videos/{}/stream", item_id),
    )
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[tokio::test]
async fn test_queue_limit_one_runs_second_after_first() {
    let h = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    let (orchestrator, backend) = (&h.orchestrator, &*h.backend);

    assert!(orchestrator.enqueue_remux(request("a")).await.unwrap());
    assert!(orchestrator.enqueue_remux(request("b")).await.unwrap());

    eventually("first fetch", move || async move { backend.fetched().len() == 1 }).await;
    let snapshot = orchestrator.queue_snapshot().await;
    assert_eq!(snapshot.active.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(snapshot.queued.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["b"]);

    // b must not start while a holds the only slot
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.fetched().len(), 1);

    backend.release(1);
    eventually("second fetch", move || async move { backend.fetched().len() == 2 }).await;
    assert!(orchestrator.downloaded_item("a").await.is_some());
    assert!(backend.fetched()[0].contains("/a/"));
    assert!(backend.fetched()[1].contains("/b/"));

    backend.release(1);
    eventually("both downloaded", move || async move {
        orchestrator.downloaded_items().await.len() == 2
    })
    .await;
    eventually("queue drained", move || async move {
        orchestrator.queue_snapshot().await.is_empty()
    })
    .await;

    assert_eq!(dir_names(&h.downloads), vec!["a.mp4", "b.mp4"]);
}

#[tokio::test]
async fn test_remux_enqueue_is_idempotent() {
    let h = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    let orchestrator = &h.orchestrator;

    assert!(orchestrator.enqueue_remux(request("a")).await.unwrap());
    assert!(!orchestrator.enqueue_remux(request("a")).await.unwrap());
    assert!(orchestrator.enqueue_remux(request("b")).await.unwrap());
    assert!(!orchestrator.enqueue_remux(request("b")).await.unwrap());

    let snapshot = orchestrator.queue_snapshot().await;
    assert_eq!(snapshot.active.len() + snapshot.queued.len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_auto_download_starts_exactly_one_transfer() {
    let h = harness(settings(DownloadMethod::Optimized, 2, true), FakeBackend::gated()).await;
    let (orchestrator, backend, api) = (&h.orchestrator, &*h.backend, &*h.api);
    let mut events = orchestrator.subscribe();

    let job_id = orchestrator.enqueue_optimized(request("movie")).await.unwrap().unwrap();
    assert_eq!(job_id, "job-1");

    // Creating again while the job is live returns the same job
    assert_eq!(
        orchestrator.enqueue_optimized(request("movie")).await.unwrap(),
        Some(job_id.clone())
    );
    assert_eq!(api.created.load(Ordering::SeqCst), 1);

    let jobs = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Optimizing);

    api.set_status(&job_id, JobStatus::Completed);
    let jobs = orchestrator.reconcile_now().await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Downloading);

    eventually("fetch started", move || async move { backend.fetched().len() == 1 }).await;
    assert_eq!(backend.fetched()[0], format!("{}/download/{}", SERVER_URL, job_id));

    // Server still says Completed; the local transfer keeps its state and
    // nothing is started twice
    for _ in 0..3 {
        let jobs = orchestrator.reconcile_now().await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Downloading);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.fetched().len(), 1);

    backend.release(1);
    eventually("download finished", move || async move {
        orchestrator.downloaded_item("movie").await.is_some()
    })
    .await;
    eventually("server copy cleaned up", move || async move {
        api.cancelled().contains(&"job-1".to_string())
    })
    .await;
    eventually("job removed", move || async move { orchestrator.jobs().await.is_empty() }).await;

    let events = drain(&mut events);
    let started = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::DownloadStarted { .. }))
        .count();
    let finished = events
        .iter()
        .filter(|e| matches!(e, OrchestratorEvent::DownloadFinished { .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(finished, 1);
    assert!(!events.iter().any(|e| matches!(e, OrchestratorEvent::JobReady { .. })));

    // The job is gone from the server, so later passes start nothing
    orchestrator.reconcile_now().await.unwrap();
    assert_eq!(backend.fetched().len(), 1);
}

#[tokio::test]
async fn test_job_ready_notified_once_and_remembered_across_restart() {
    let store = memory_store().await;
    let api = Arc::new(FakeJobApi::default());
    let h = harness_with(
        settings(DownloadMethod::Optimized, 2, false),
        Arc::clone(&store),
        Arc::clone(&api),
        FakeBackend::default(),
    )
    .await;
    let mut events = h.orchestrator.subscribe();

    let job_id = h.orchestrator.enqueue_optimized(request("episode")).await.unwrap().unwrap();
    h.orchestrator.reconcile_now().await.unwrap();
    api.set_status(&job_id, JobStatus::Completed);

    h.orchestrator.reconcile_now().await.unwrap();
    let first = drain(&mut events);
    let ready: Vec<_> = first
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::JobReady { job_id, item } => Some((job_id.clone(), item.id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(ready, vec![(job_id.clone(), "episode".to_string())]);

    // Unchanged listings publish nothing
    h.orchestrator.reconcile_now().await.unwrap();
    h.orchestrator.reconcile_now().await.unwrap();
    assert!(drain(&mut events).is_empty());
    assert!(h.backend.fetched().is_empty());

    drop(h);

    // Same store and server after a restart: the job was already surfaced
    let restarted = harness_with(
        settings(DownloadMethod::Optimized, 2, false),
        store,
        Arc::clone(&api),
        FakeBackend::default(),
    )
    .await;
    let mut events = restarted.orchestrator.subscribe();

    let jobs = restarted.orchestrator.reconcile_now().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::JobReady { .. })));
}

#[tokio::test]
async fn test_job_completed_while_closed_is_surfaced_on_first_poll() {
    let store = memory_store().await;
    let device_id = offline_core::storage::get_or_create_device_id(store.as_ref())
        .await
        .unwrap();

    let api = Arc::new(FakeJobApi::default());
    let mut job = Job::optimizing("job-offline", MediaItem::new("film", "Film"));
    job.device_id = Some(device_id);
    job.status = JobStatus::Completed;
    job.progress = 100.0;
    api.insert(job);

    let h = harness_with(
        settings(DownloadMethod::Optimized, 2, false),
        store,
        api,
        FakeBackend::default(),
    )
    .await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.reconcile_now().await.unwrap();
    h.orchestrator.reconcile_now().await.unwrap();

    let ready = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, OrchestratorEvent::JobReady { .. }))
        .count();
    assert_eq!(ready, 1);
}

#[tokio::test]
async fn test_no_space_left_fails_once_without_retry() {
    let backend = FakeBackend::default();
    backend.fail("http://media.test/videos/big/stream", TransferErrorKind::NoSpaceLeft);
    let h = harness(settings(DownloadMethod::Remux, 2, false), backend).await;
    let mut events = h.orchestrator.subscribe();

    assert!(h.orchestrator.enqueue_remux(request("big")).await.unwrap());

    let failure = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                OrchestratorEvent::DownloadFailed { job_id, kind, message, .. } => break (job_id, kind, message),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(failure.0, "big");
    assert_eq!(failure.1, TransferErrorKind::NoSpaceLeft);
    assert_eq!(failure.2, TransferErrorKind::NoSpaceLeft.user_message());

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.backend.fetched().len(), 1);
    assert!(h.orchestrator.active_transfers().await.is_empty());
    assert!(h.orchestrator.queue_snapshot().await.is_empty());
    assert!(h.orchestrator.downloaded_item("big").await.is_none());
    assert!(dir_names(&h.downloads).is_empty());
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::DownloadFailed { .. })));
}

/// Three downloaded files and two live remote jobs
async fn populated(h: &Harness) {
    let orchestrator = &h.orchestrator;
    for id in ["one", "two", "three"] {
        assert!(orchestrator.enqueue_remux(request(id)).await.unwrap());
    }
    eventually("three downloads", move || async move {
        orchestrator.downloaded_items().await.len() == 3
    })
    .await;

    orchestrator.enqueue_optimized(request("four")).await.unwrap().unwrap();
    orchestrator.enqueue_optimized(request("five")).await.unwrap().unwrap();
    assert_eq!(orchestrator.reconcile_now().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_all_removes_files_records_and_jobs() {
    let h = harness(settings(DownloadMethod::Remux, 2, false), FakeBackend::default()).await;
    populated(&h).await;
    let mut events = h.orchestrator.subscribe();

    let report = h.orchestrator.delete_all_downloads().await.unwrap();

    assert_eq!(report.files_deleted, 3);
    assert!(report.is_complete());
    assert!(dir_names(&h.downloads).is_empty());
    assert!(h.orchestrator.downloaded_items().await.is_empty());
    assert!(h.orchestrator.jobs().await.is_empty());
    assert_eq!(h.api.cancel_all_calls.load(Ordering::SeqCst), 1);
    assert!(h.orchestrator.reconcile_now().await.unwrap().is_empty());

    assert!(drain(&mut events).contains(&OrchestratorEvent::AllFilesDeleted {
        files_deleted: 3,
        complete: true,
    }));
}

#[tokio::test]
async fn test_delete_all_runs_every_phase_when_a_file_resists() {
    let h = harness(settings(DownloadMethod::Remux, 2, false), FakeBackend::default()).await;
    populated(&h).await;

    // A directory cannot be removed as a file
    std::fs::create_dir(h.downloads.join("stuck.mp4")).unwrap();

    let result = h.orchestrator.delete_all_downloads().await;

    match result {
        Err(OfflineError::PartialFailure { phases }) => assert_eq!(phases.len(), 1),
        other => panic!("expected partial failure, got {:?}", other),
    }
    assert_eq!(dir_names(&h.downloads), vec!["stuck.mp4"]);
    assert!(h.orchestrator.downloaded_items().await.is_empty());
    assert_eq!(h.api.cancel_all_calls.load(Ordering::SeqCst), 1);
    assert!(h.orchestrator.jobs().await.is_empty());
}

#[tokio::test]
async fn test_delete_single_download() {
    let h = harness(settings(DownloadMethod::Remux, 2, false), FakeBackend::default()).await;
    let orchestrator = &h.orchestrator;
    orchestrator.enqueue_remux(request("solo")).await.unwrap();
    eventually("download", move || async move {
        orchestrator.downloaded_item("solo").await.is_some()
    })
    .await;

    let outcome = orchestrator.delete_download("solo").await.unwrap();
    assert!(outcome.record.is_some());
    assert!(outcome.warning.is_none());
    assert!(dir_names(&h.downloads).is_empty());

    let again = orchestrator.delete_download("solo").await.unwrap();
    assert!(again.record.is_none());
}

#[tokio::test]
async fn test_pending_queue_restored_after_restart() {
    let first = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    first.orchestrator.enqueue_remux(request("a")).await.unwrap();
    first.orchestrator.enqueue_remux(request("b")).await.unwrap();

    let store = &*first.store;
    eventually("queue persisted", move || async move {
        match store.get(KEY_DOWNLOAD_QUEUE).await.unwrap() {
            Some(raw) => serde_json::from_str::<Vec<DownloadRequest>>(&raw).unwrap().len() == 2,
            None => false,
        }
    })
    .await;
    let backend = &*first.backend;
    eventually("first fetch", move || async move { backend.fetched().len() == 1 }).await;

    first.orchestrator.shutdown().await;

    // Cancelling a on the way down neither starts b nor rewrites the queue
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(first.backend.fetched().len(), 1);
    assert!(first.orchestrator.active_transfers().await.is_empty());
    assert!(!first.orchestrator.enqueue_remux(request("c")).await.unwrap());

    let persisted = store.get(KEY_DOWNLOAD_QUEUE).await.unwrap().unwrap();
    let ids: Vec<String> = serde_json::from_str::<Vec<DownloadRequest>>(&persisted)
        .unwrap()
        .iter()
        .map(|r| r.item_id().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let restored_store = memory_store().await;
    restored_store.set(KEY_DOWNLOAD_QUEUE, &persisted).await.unwrap();
    let second = harness_with(
        settings(DownloadMethod::Remux, 1, false),
        restored_store,
        Arc::new(FakeJobApi::default()),
        FakeBackend::default(),
    )
    .await;

    let orchestrator = &second.orchestrator;
    eventually("restored downloads", move || async move {
        orchestrator.downloaded_items().await.len() == 2
    })
    .await;
    assert_eq!(dir_names(&second.downloads), vec!["a.mp4", "b.mp4"]);
}

#[tokio::test]
async fn test_optimized_requires_server_configuration() {
    let settings = OrchestratorSettings::builder()
        .download_method(DownloadMethod::Optimized)
        .build()
        .unwrap();
    let h = harness(settings, FakeBackend::default()).await;

    let err = h.orchestrator.enqueue_optimized(request("x")).await.unwrap_err();
    assert!(err.is_configuration_error());
    assert!(h.orchestrator.reconcile_now().await.unwrap_err().is_configuration_error());
    assert_eq!(h.api.created.load(Ordering::SeqCst), 0);

    h.orchestrator.set_foreground(true).await;
    assert!(!h.orchestrator.is_polling());
}

#[tokio::test]
async fn test_delete_all_during_transfer_starts_nothing_queued() {
    let h = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    let (orchestrator, backend, store) = (&h.orchestrator, &*h.backend, &*h.store);
    for id in ["a", "b", "c"] {
        assert!(orchestrator.enqueue_remux(request(id)).await.unwrap());
    }
    eventually("first fetch", move || async move { backend.fetched().len() == 1 }).await;

    let report = orchestrator.delete_all_downloads().await.unwrap();
    assert_eq!(report.files_deleted, 0);

    // Freeing a's slot must not promote b or c
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.fetched().len(), 1);
    assert!(orchestrator.active_transfers().await.is_empty());
    assert!(orchestrator.queue_snapshot().await.is_empty());
    assert!(orchestrator.downloaded_items().await.is_empty());
    assert!(dir_names(&h.downloads).is_empty());

    eventually("queue persisted empty", move || async move {
        match store.get(KEY_DOWNLOAD_QUEUE).await.unwrap() {
            Some(raw) => serde_json::from_str::<Vec<DownloadRequest>>(&raw).unwrap().is_empty(),
            None => false,
        }
    })
    .await;

    // The queue still works afterwards
    assert!(orchestrator.enqueue_remux(request("d")).await.unwrap());
    eventually("next fetch", move || async move { backend.fetched().len() == 2 }).await;
    backend.release(1);
    eventually("d downloaded", move || async move {
        orchestrator.downloaded_item("d").await.is_some()
    })
    .await;
}

#[tokio::test]
async fn test_cancel_active_frees_slot_after_transfer_stops() {
    let h = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    let (orchestrator, backend) = (&h.orchestrator, &*h.backend);
    let mut events = orchestrator.subscribe();

    orchestrator.enqueue_remux(request("a")).await.unwrap();
    orchestrator.enqueue_remux(request("b")).await.unwrap();
    eventually("first fetch", move || async move { backend.fetched().len() == 1 }).await;

    orchestrator.cancel("a").await.unwrap();
    eventually("second fetch", move || async move { backend.fetched().len() == 2 }).await;
    assert_eq!(orchestrator.active_transfers().await, vec!["b".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(&mut events);
    let cancelled_a = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::DownloadCancelled { item_id, .. } if item_id == "a"))
        .unwrap();
    let started_b = events
        .iter()
        .position(|e| matches!(e, OrchestratorEvent::DownloadStarted { item_id, .. } if item_id == "b"))
        .unwrap();
    assert!(cancelled_a < started_b);
    assert!(!dir_names(&h.downloads).iter().any(|n| n.starts_with("a.")));

    // Cancelling a queued entry never reaches the transfer layer
    orchestrator.enqueue_remux(request("c")).await.unwrap();
    orchestrator.cancel("c").await.unwrap();
    assert!(orchestrator.queue_snapshot().await.queued.is_empty());
    assert_eq!(backend.fetched().len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_raising_concurrency_promotes_waiting_entries() {
    let h = harness(settings(DownloadMethod::Remux, 1, false), FakeBackend::gated()).await;
    let (orchestrator, backend) = (&h.orchestrator, &*h.backend);
    for id in ["a", "b", "c"] {
        orchestrator.enqueue_remux(request(id)).await.unwrap();
    }
    eventually("first fetch", move || async move { backend.fetched().len() == 1 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.fetched().len(), 1);

    orchestrator
        .update_settings(settings(DownloadMethod::Remux, 3, false))
        .await
        .unwrap();

    eventually("all fetching", move || async move { backend.fetched().len() == 3 }).await;
    let snapshot = orchestrator.queue_snapshot().await;
    assert_eq!(snapshot.active.len(), 3);
    assert!(snapshot.queued.is_empty());

    backend.release(3);
    eventually("all downloaded", move || async move {
        orchestrator.downloaded_items().await.len() == 3
    })
    .await;
}

fn polling_settings(method: DownloadMethod) -> OrchestratorSettings {
    OrchestratorSettings::builder()
        .optimized_server_url(SERVER_URL)
        .download_method(method)
        .poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

/// Waits out an in-flight tick, then checks no further listing happens
async fn assert_quiet(api: &FakeJobApi) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = api.listed.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(api.listed.load(Ordering::SeqCst), before);
}

async fn assert_listing(api: &FakeJobApi) {
    let before = api.listed.load(Ordering::SeqCst);
    eventually("server listing", move || async move {
        api.listed.load(Ordering::SeqCst) >= before + 2
    })
    .await;
}

#[tokio::test]
async fn test_polling_follows_foreground_authorization_and_method() {
    let h = harness(polling_settings(DownloadMethod::Optimized), FakeBackend::default()).await;
    let (orchestrator, api) = (&h.orchestrator, &*h.api);

    // Background by default
    assert!(!orchestrator.is_polling());
    assert_quiet(api).await;
    assert_eq!(api.listed.load(Ordering::SeqCst), 0);

    orchestrator.set_foreground(true).await;
    assert!(orchestrator.is_polling());
    assert_listing(api).await;

    orchestrator.set_foreground(false).await;
    assert!(!orchestrator.is_polling());
    assert_quiet(api).await;

    orchestrator.set_foreground(true).await;
    assert!(orchestrator.is_polling());

    orchestrator.set_authorization(None).await;
    assert!(!orchestrator.is_polling());
    assert_quiet(api).await;

    orchestrator.set_authorization(Some(AUTH.to_string())).await;
    assert!(orchestrator.is_polling());
    assert_listing(api).await;

    orchestrator
        .update_settings(polling_settings(DownloadMethod::Remux))
        .await
        .unwrap();
    assert!(!orchestrator.is_polling());
    assert_quiet(api).await;

    orchestrator
        .update_settings(polling_settings(DownloadMethod::Optimized))
        .await
        .unwrap();
    assert!(orchestrator.is_polling());
    assert_listing(api).await;

    orchestrator.shutdown().await;
    assert!(!orchestrator.is_polling());
}

#[tokio::test]
async fn test_downloaded_item_creates_no_job() {
    let h = harness(settings(DownloadMethod::Optimized, 2, false), FakeBackend::default()).await;
    let orchestrator = &h.orchestrator;

    orchestrator.enqueue_remux(request("movie")).await.unwrap();
    eventually("download", move || async move {
        orchestrator.downloaded_item("movie").await.is_some()
    })
    .await;

    assert_eq!(orchestrator.enqueue_optimized(request("movie")).await.unwrap(), None);
    assert_eq!(
        orchestrator.download(request("movie")).await.unwrap(),
        DownloadAction::AlreadyDownloaded {
            item_id: "movie".to_string()
        }
    );
    assert_eq!(h.api.created.load(Ordering::SeqCst), 0);
    assert!(orchestrator.jobs().await.is_empty());

    // Items not on disk still go to the server
    assert_eq!(
        orchestrator.download(request("other")).await.unwrap(),
        DownloadAction::Optimizing {
            job_id: "job-1".to_string()
        }
    );
}
