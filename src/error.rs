//! Error types for dataset download operations.

use std::io;
use thiserror::Error;

/// Errors that abort a dataset download as a whole.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error talking to the metadata API or the bucket.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// The dataset, or the requested path inside it, has no objects.
    #[error("{0}")]
    NotFound(String),

    /// The metadata API answered with a non-success status.
    #[error("API request failed with HTTP {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or a short description.
        message: String,
    },

    /// The user declined a confirmation prompt.
    #[error("Operation declined by user")]
    Declined,

    /// Object storage failure outside a single object transfer (e.g. listing).
    #[error("Storage request failed: {0}")]
    Storage(String),
}

/// Failure of a single object transfer.
///
/// These never abort a batch; the downloader folds them into a
/// [`DownloadOutcome`](crate::DownloadOutcome) and the object is retried.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Local and remote state disagree (size, checksum or checkpoint mismatch).
    #[error("Inconsistent transfer: {0}")]
    Inconsistent(String),

    /// Storage answered with a server-side error.
    #[error("Storage server error: HTTP {status}")]
    Server {
        /// HTTP status code (5xx).
        status: u16,
    },

    /// Connection, timeout or body streaming failure.
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    /// Storage answered with an unexpected non-server status.
    #[error("Unexpected storage response: HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// Storage answered a ranged request with the whole object.
    #[error("Storage ignored the requested byte range")]
    RangeIgnored,

    /// I/O error writing the local file or checkpoint.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Whether the failure is a known transient storage or network condition.
    ///
    /// Both classes are retried; the split only matters for logging.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Inconsistent(_) | TransferError::Server { .. } | TransferError::Network(_)
        )
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Other(format!("Checkpoint encoding error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_classification() {
        assert!(TransferError::Inconsistent("size".to_string()).is_transient());
        assert!(TransferError::Server { status: 503 }.is_transient());
        assert!(!TransferError::Status { status: 403 }.is_transient());
        assert!(!TransferError::Io(io::Error::other("disk full")).is_transient());
        assert!(!TransferError::Other("boom".to_string()).is_transient());
    }
}
