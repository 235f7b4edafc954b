//! Offline download core for a mobile media client
//!
//! Downloads media items for offline playback, either directly from the media
//! server (remux, through a local FIFO queue) or through an optimization
//! server that transcodes first. [`DownloadOrchestrator`] is the entry point;
//! everything else is exposed for hosts that need finer control.

pub mod api;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod reconcile;
pub mod storage;

pub use api::{JobApi, OptimizeClient, ServerAccess};
pub use catalog::{DownloadedItem, LocalCatalog};
pub use config::{DownloadMethod, OrchestratorSettings};
pub use download::{HttpTransferBackend, TransferBackend};
pub use error::{OfflineError, Result, TransferErrorKind};
pub use orchestrator::{DownloadAction, DownloadOrchestrator, DownloadRequest, OrchestratorEvent};
