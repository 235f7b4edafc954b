//! Local catalog of completed downloads
//!
//! The catalog is a JSON list under `downloadedItems` plus the files in the
//! download directory. A record exists iff its file exists, so every mutation
//! touches both and the startup [`LocalCatalog::verify`] pass repairs whatever
//! a crash left behind.
//!
//! Writes are serialized by one async mutex; the cached list is the single
//! source of truth between saves.

pub mod files;

use crate::api::models::{MediaItem, MediaSource};
use crate::error::{OfflineError, Result};
use crate::storage::kv::{load_json_or_default, save_json, KeyValueStore, KEY_DOWNLOADED_ITEMS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use files::{DownloadDirectory, PART_SUFFIX};

/// A completed local artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedItem {
    pub item: MediaItem,
    pub media_source: MediaSource,
    pub file_path: PathBuf,

    #[serde(default = "Utc::now")]
    pub downloaded_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl DownloadedItem {
    pub fn new(item: MediaItem, media_source: MediaSource, file_path: PathBuf) -> Self {
        Self {
            item,
            media_source,
            file_path,
            downloaded_at: Utc::now(),
            size: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }
}

/// Result of removing one item
#[derive(Debug)]
pub struct RemoveOutcome {
    /// The record that was removed, if there was one
    pub record: Option<DownloadedItem>,
    /// Set when the record is gone but a file could not be deleted
    pub warning: Option<OfflineError>,
}

/// Per-phase result of [`LocalCatalog::remove_all`]
#[derive(Debug, Default)]
pub struct RemoveAllReport {
    pub files_deleted: usize,
    pub file_errors: Vec<String>,
    pub catalog_error: Option<String>,
    pub remote_error: Option<String>,
}

impl RemoveAllReport {
    /// True when all three phases succeeded
    pub fn is_complete(&self) -> bool {
        self.file_errors.is_empty() && self.catalog_error.is_none() && self.remote_error.is_none()
    }

    /// Names of the phases that failed
    pub fn failed_phases(&self) -> Vec<String> {
        let mut phases = Vec::new();
        if !self.file_errors.is_empty() {
            phases.push(format!("files ({} not deleted)", self.file_errors.len()));
        }
        if let Some(e) = &self.catalog_error {
            phases.push(format!("catalog ({})", e));
        }
        if let Some(e) = &self.remote_error {
            phases.push(format!("remote jobs ({})", e));
        }
        phases
    }

    /// `Ok(self)` when complete, otherwise `PartialFailure`
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(OfflineError::PartialFailure {
                phases: self.failed_phases(),
            })
        }
    }
}

/// What the startup consistency pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Item ids whose file was missing
    pub pruned_records: Vec<String>,
    /// Files no record referenced
    pub removed_files: Vec<PathBuf>,
}

/// `items` with `record` inserted or replacing the record of the same item
fn with_record(items: &[DownloadedItem], record: DownloadedItem) -> Vec<DownloadedItem> {
    let mut next = items.to_vec();
    match next.iter_mut().find(|d| d.id() == record.id()) {
        Some(existing) => *existing = record,
        None => next.push(record),
    }
    next
}

/// Persistent record of completed downloads
pub struct LocalCatalog {
    store: Arc<dyn KeyValueStore>,
    directory: DownloadDirectory,
    items: Mutex<Vec<DownloadedItem>>,
}

impl LocalCatalog {
    /// Load the catalog and make sure the download directory exists
    pub async fn open(store: Arc<dyn KeyValueStore>, directory: DownloadDirectory) -> Result<Self> {
        directory.ensure_exists().await?;
        let items: Vec<DownloadedItem> = load_json_or_default(store.as_ref(), KEY_DOWNLOADED_ITEMS).await?;

        tracing::debug!(count = items.len(), dir = %directory.root().display(), "catalog loaded");
        Ok(Self {
            store,
            directory,
            items: Mutex::new(items),
        })
    }

    pub fn directory(&self) -> &DownloadDirectory {
        &self.directory
    }

    pub async fn list(&self) -> Vec<DownloadedItem> {
        self.items.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<DownloadedItem> {
        self.items.lock().await.iter().find(|d| d.id() == id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.items.lock().await.iter().any(|d| d.id() == id)
    }

    /// Insert a record, replacing any record with the same item id
    pub async fn upsert(&self, record: DownloadedItem) -> Result<()> {
        let mut items = self.items.lock().await;
        let next = with_record(&items, record);

        save_json(self.store.as_ref(), KEY_DOWNLOADED_ITEMS, &next).await?;
        *items = next;
        Ok(())
    }

    /// Move a finished partial file to `record.file_path` and record it
    ///
    /// Rename and save happen under the catalog lock, so a concurrent
    /// [`remove_all`](Self::remove_all) sees either both or neither. If the
    /// save fails the renamed file is deleted again.
    pub async fn commit(&self, part: &Path, record: DownloadedItem) -> Result<()> {
        let mut items = self.items.lock().await;

        self.directory.finalize(part, &record.file_path).await?;

        let path = record.file_path.clone();
        let next = with_record(&items, record);
        if let Err(e) = save_json(self.store.as_ref(), KEY_DOWNLOADED_ITEMS, &next).await {
            if let Err(cleanup) = self.directory.safe_delete(&path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "could not remove unrecorded file");
            }
            return Err(e);
        }

        *items = next;
        Ok(())
    }

    /// Remove the record and every file belonging to `id`
    ///
    /// The record is removed first. A file that cannot be deleted afterwards
    /// leaves the record removed and is reported as a `ConsistencyWarning`;
    /// the next [`verify`](Self::verify) pass retries the delete.
    pub async fn remove(&self, id: &str) -> Result<RemoveOutcome> {
        let mut items = self.items.lock().await;

        let record = items.iter().find(|d| d.id() == id).cloned();
        if record.is_some() {
            let next: Vec<DownloadedItem> = items.iter().filter(|d| d.id() != id).cloned().collect();
            save_json(self.store.as_ref(), KEY_DOWNLOADED_ITEMS, &next).await?;
            *items = next;
        }

        let mut paths = self.directory.files_for_item(id).await.unwrap_or_default();
        if let Some(r) = &record {
            if !paths.contains(&r.file_path) {
                paths.push(r.file_path.clone());
            }
        }

        let mut failures = Vec::new();
        for path in &paths {
            if let Err(e) = self.directory.safe_delete(path).await {
                failures.push(e.to_string());
            }
        }

        let warning = if failures.is_empty() {
            None
        } else {
            let warning = OfflineError::ConsistencyWarning {
                item_id: id.to_string(),
                message: failures.join("; "),
            };
            tracing::warn!(item_id = id, error = %warning, "record removed but file remains");
            Some(warning)
        };

        if record.is_some() {
            tracing::info!(item_id = id, "removed downloaded item");
        }
        Ok(RemoveOutcome { record, warning })
    }

    /// Delete every file, clear the catalog, then cancel remote jobs
    ///
    /// All three phases always run; failures are collected in the report.
    pub async fn remove_all<F, Fut>(&self, cancel_remote: F) -> RemoveAllReport
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = RemoveAllReport::default();
        let mut items = self.items.lock().await;

        match self.directory.entries().await {
            Ok(entries) => {
                for path in entries {
                    match self.directory.safe_delete(&path).await {
                        Ok(()) => report.files_deleted += 1,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "could not delete file");
                            report.file_errors.push(e.to_string());
                        }
                    }
                }
            }
            Err(e) => report.file_errors.push(e.to_string()),
        }

        match self.store.remove(KEY_DOWNLOADED_ITEMS).await {
            Ok(()) => items.clear(),
            Err(e) => {
                tracing::error!(error = %e, "could not clear catalog");
                report.catalog_error = Some(e.to_string());
            }
        }
        drop(items);

        if let Err(e) = cancel_remote().await {
            tracing::warn!(error = %e, "could not cancel remote jobs");
            report.remote_error = Some(e.to_string());
        }

        tracing::info!(
            files_deleted = report.files_deleted,
            complete = report.is_complete(),
            "removed all downloads"
        );
        report
    }

    /// Drop records without a file and delete files without a record
    pub async fn verify(&self) -> Result<VerifyReport> {
        let mut items = self.items.lock().await;
        let mut report = VerifyReport::default();

        let mut kept = Vec::with_capacity(items.len());
        for record in items.iter() {
            if DownloadDirectory::file_exists(&record.file_path).await {
                kept.push(record.clone());
            } else {
                report.pruned_records.push(record.id().to_string());
            }
        }

        if !report.pruned_records.is_empty() {
            save_json(self.store.as_ref(), KEY_DOWNLOADED_ITEMS, &kept).await?;
            *items = kept;
        }

        let referenced: HashSet<&PathBuf> = items.iter().map(|d| &d.file_path).collect();
        for path in self.directory.entries().await? {
            if referenced.contains(&path) || path.is_dir() {
                continue;
            }
            match self.directory.safe_delete(&path).await {
                Ok(()) => report.removed_files.push(path),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not delete orphan file"),
            }
        }

        if !report.pruned_records.is_empty() || !report.removed_files.is_empty() {
            tracing::info!(
                pruned = report.pruned_records.len(),
                orphans = report.removed_files.len(),
                "catalog repaired"
            );
        }
        Ok(report)
    }

    /// Total bytes of the files the catalog references
    pub async fn disk_usage(&self) -> u64 {
        let paths: Vec<PathBuf> = self.items.lock().await.iter().map(|d| d.file_path.clone()).collect();

        let mut total = 0;
        for path in paths {
            total += DownloadDirectory::file_size(&path).await.unwrap_or(0);
        }
        total
    }
}
