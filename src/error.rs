//! Error types for the offline download core
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by the component that raises them (configuration, remote
//! job API, transfers, catalog, storage) so the orchestrator can decide per
//! category whether to retry, surface or just log.
//!
//! ## Taxonomy
//!
//! - `ConfigurationError` - missing server URL, device id or authorization.
//!   Never retried, needs user action.
//! - `NetworkError { is_transient: true }` - the transient error. Retried only by
//!   the next reconciliation tick, never synchronously.
//! - `TransferFailed { kind }` - terminal for that job, the user must re-enqueue.
//! - `ConsistencyWarning` - catalog/file mismatch found while deleting. Logged,
//!   never aborts the surrounding bulk operation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our OfflineError type
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Classification of a failed file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferErrorKind {
    /// The device ran out of storage while writing the file
    NoSpaceLeft,
    /// The server no longer has the file (404 / 410)
    NotFoundOnServer,
    /// Anything else
    Unknown,
}

impl TransferErrorKind {
    /// Map an HTTP status returned by the download endpoint
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => TransferErrorKind::NotFoundOnServer,
            507 => TransferErrorKind::NoSpaceLeft,
            _ => TransferErrorKind::Unknown,
        }
    }

    /// Map an I/O error raised while writing the destination file
    pub fn from_io(err: &std::io::Error) -> Self {
        // ENOSPC is 28 on Linux, Android, macOS and iOS
        if err.raw_os_error() == Some(28) {
            TransferErrorKind::NoSpaceLeft
        } else {
            TransferErrorKind::Unknown
        }
    }

    /// Message suitable for a toast
    pub fn user_message(&self) -> &'static str {
        match self {
            TransferErrorKind::NoSpaceLeft => "Not enough free space on this device to finish the download.",
            TransferErrorKind::NotFoundOnServer => "The file is no longer available on the server.",
            TransferErrorKind::Unknown => "The download failed. Please try again.",
        }
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransferErrorKind::NoSpaceLeft => "no space left",
            TransferErrorKind::NotFoundOnServer => "not found on server",
            TransferErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Main error type for the download orchestrator
#[derive(Error, Debug)]
pub enum OfflineError {
    // ===== Configuration Errors =====

    /// Server URL, device id or authorization is missing or unusable
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A required parameter for starting a transfer was not supplied
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Component state does not allow the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ===== Remote Job API Errors =====

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether the next poll tick may succeed
        is_transient: bool,
    },

    /// Optimization server answered with a non-success status
    #[error("API request failed: {message}")]
    ApiRequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// API endpoint that failed
        endpoint: Option<String>,
    },

    /// Operation exceeded its time budget
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    // ===== Transfer Errors =====

    /// File transfer failed; terminal for the job
    #[error("Transfer failed ({kind}): {message}")]
    TransferFailed {
        kind: TransferErrorKind,
        message: String,
    },

    /// A transfer or job for this id is already in flight
    #[error("Job already active: {0}")]
    DuplicateJob(String),

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    // ===== Catalog Errors =====

    /// Catalog record and file on disk disagree
    #[error("Catalog inconsistency for '{item_id}': {message}")]
    ConsistencyWarning {
        item_id: String,
        message: String,
    },

    /// A bulk operation finished but some phases failed
    #[error("Partially failed: {}", phases.join(", "))]
    PartialFailure {
        /// Human readable description of each failed phase
        phases: Vec<String>,
    },

    /// Record not found
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Storage Errors =====

    /// Database schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Server base URL could not be parsed
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
}

impl OfflineError {
    /// Create a ConfigurationError
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        OfflineError::ConfigurationError(message.into())
    }

    /// Create a transient NetworkError
    pub fn transient<S: Into<String>>(message: S) -> Self {
        OfflineError::NetworkError {
            message: message.into(),
            is_transient: true,
        }
    }

    /// Create an ApiRequestFailed error
    pub fn api_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        OfflineError::ApiRequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create a TransferFailed error
    pub fn transfer<S: Into<String>>(kind: TransferErrorKind, message: S) -> Self {
        OfflineError::TransferFailed {
            kind,
            message: message.into(),
        }
    }

    /// Check if a later poll tick may succeed where this one failed
    ///
    /// Nothing in the core retries synchronously; this only tells the
    /// reconciliation loop whether the failure is worth logging as an error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfflineError::NetworkError { is_transient: true, .. }
                | OfflineError::Timeout(_)
                | OfflineError::ApiRequestFailed { status_code: Some(500..=599), .. }
        )
    }

    /// Check if the error needs the user to fix settings or sign in
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            OfflineError::ConfigurationError(_) | OfflineError::MissingParameter(_)
        )
    }

    /// Transfer classification of this error
    ///
    /// Errors raised outside the transfer path map to `Unknown`.
    pub fn transfer_kind(&self) -> TransferErrorKind {
        match self {
            OfflineError::TransferFailed { kind, .. } => *kind,
            OfflineError::IoError(e) => TransferErrorKind::from_io(e),
            OfflineError::ApiRequestFailed { status_code: Some(code), .. } => {
                TransferErrorKind::from_status(*code)
            }
            OfflineError::ReqwestError(e) => e
                .status()
                .map(|s| TransferErrorKind::from_status(s.as_u16()))
                .unwrap_or(TransferErrorKind::Unknown),
            _ => TransferErrorKind::Unknown,
        }
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            OfflineError::ConfigurationError(_) => {
                "The optimization server is not configured. Check the server URL in settings and sign in again.".to_string()
            }
            OfflineError::NetworkError { .. } | OfflineError::Timeout(_) => {
                "Could not reach the optimization server. It will be retried automatically.".to_string()
            }
            OfflineError::TransferFailed { kind, .. } => kind.user_message().to_string(),
            OfflineError::PartialFailure { phases } => {
                format!("Some downloads could not be deleted ({}).", phases.join(", "))
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OfflineError::transient("connection reset").is_retryable());
        assert!(OfflineError::api_failed("bad gateway", Some(502), None).is_retryable());
        assert!(!OfflineError::api_failed("forbidden", Some(403), None).is_retryable());
        assert!(!OfflineError::configuration("no url").is_retryable());
        assert!(OfflineError::configuration("no url").is_configuration_error());
    }

    #[test]
    fn test_transfer_kind_mapping() {
        let enospc = std::io::Error::from_raw_os_error(28);
        assert_eq!(
            OfflineError::IoError(enospc).transfer_kind(),
            TransferErrorKind::NoSpaceLeft
        );
        assert_eq!(
            OfflineError::api_failed("gone", Some(404), None).transfer_kind(),
            TransferErrorKind::NotFoundOnServer
        );
        assert_eq!(OfflineError::Cancelled.transfer_kind(), TransferErrorKind::Unknown);
    }

    #[test]
    fn test_partial_failure_message() {
        let err = OfflineError::PartialFailure {
            phases: vec!["files".to_string(), "remote".to_string()],
        };
        assert_eq!(err.to_string(), "Partially failed: files, remote");
    }
}
