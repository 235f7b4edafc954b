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


//! Download directory operations
//!
//! # Layout
//! The directory is flat. A finished download is `{itemId}.{ext}`; while a
//! transfer is running it is written to `{itemId}.{ext}.part` and renamed into
//! place on success.
//!
//! # Key Operations
//! - Path naming for items and partial files
//! - Safe deletes (with retry, missing file is not an error)
//! - Listing directory entries and the files belonging to one item

use crate::error::{OfflineError, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Suffix of files still being written
pub const PART_SUFFIX: &str = ".part";

/// The directory downloaded files live in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDirectory {
    root: PathBuf,
}

impl DownloadDirectory {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory (and parents) if needed
    pub async fn ensure_exists(&self) -> Result<()> {
        if Self::file_exists(&self.root).await {
            return Ok(());
        }

        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Final path of an item's file: `{root}/{itemId}.{ext}`
    pub fn file_path(&self, item_id: &str, extension: &str) -> PathBuf {
        let extension = extension.trim_start_matches('.');
        let extension = if extension.is_empty() { "mp4" } else { extension };
        self.root
            .join(format!("{}.{}", safe_file_stem(item_id), safe_file_stem(extension)))
    }

    /// Path a transfer writes to before the rename
    pub fn part_path(destination: &Path) -> PathBuf {
        let mut name = destination.as_os_str().to_os_string();
        name.push(PART_SUFFIX);
        PathBuf::from(name)
    }

    /// Delete a file, retrying transient failures
    ///
    /// A missing file counts as deleted. Directories are refused: nothing in the
    /// download directory is removed recursively.
    pub async fn safe_delete(&self, path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::safe_delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Unsupported || attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(OfflineError::IoError(io::Error::new(
                        e.kind(),
                        format!("failed to delete {}: {}", path.display(), e),
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }
    }

    async fn safe_delete_once(path: &Path) -> io::Result<()> {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "is a directory"));
        }

        match fs::remove_file(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Check if file exists
    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Get file size in bytes
    pub async fn file_size(path: &Path) -> Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    /// Every entry directly under the root (files and anything else)
    ///
    /// A missing root is an empty listing.
    pub async fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    }

    /// Files named `{itemId}.*`, including partial files
    pub async fn files_for_item(&self, item_id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.", safe_file_stem(item_id));
        let entries = self.entries().await?;

        Ok(entries
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Move a finished partial file to its final name
    pub async fn finalize(&self, part: &Path, destination: &Path) -> Result<()> {
        if Self::file_exists(destination).await {
            self.safe_delete(destination).await?;
        }
        fs::rename(part, destination).await?;
        Ok(())
    }
}

/// Replace characters that are not allowed in a file name
pub fn safe_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_naming() {
        let dir = DownloadDirectory::new("/downloads");
        assert_eq!(dir.file_path("abc", "mkv"), PathBuf::from("/downloads/abc.mkv"));
        assert_eq!(dir.file_path("abc", ".mp4"), PathBuf::from("/downloads/abc.mp4"));
        assert_eq!(dir.file_path("a/b", ""), PathBuf::from("/downloads/a_b.mp4"));
        assert_eq!(
            DownloadDirectory::part_path(Path::new("/downloads/abc.mp4")),
            PathBuf::from("/downloads/abc.mp4.part")
        );
    }

    #[tokio::test]
    async fn test_safe_delete_missing_file_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadDirectory::new(temp_dir.path());

        dir.safe_delete(&temp_dir.path().join("nope.mp4")).await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_delete_refuses_directories() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadDirectory::new(temp_dir.path());
        let nested = temp_dir.path().join("nested.mp4");
        std::fs::create_dir(&nested).unwrap();

        assert!(dir.safe_delete(&nested).await.is_err());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_files_for_item() {
        let temp_dir = TempDir::new().unwrap();
        let dir = DownloadDirectory::new(temp_dir.path().join("downloads"));
        assert!(dir.entries().await.unwrap().is_empty());

        dir.ensure_exists().await.unwrap();
        for name in ["abc.mp4", "abc.mkv.part", "abcd.mp4", "other.mp4"] {
            std::fs::write(dir.root().join(name), b"x").unwrap();
        }

        let files = dir.files_for_item("abc").await.unwrap();
        assert_eq!(
            files,
            vec![dir.root().join("abc.mkv.part"), dir.root().join("abc.mp4")]
        );
        assert_eq!(dir.entries().await.unwrap().len(), 4);
    }
}
