//! Data structures shared by the download engine.

use crate::progress::ProgressTracker;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Transfer part size (10 MiB).
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Objects below this size are fetched with a single request (50 MiB).
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Concurrent part connections per object.
pub const DEFAULT_PART_THREADS: usize = 4;

/// Download rounds attempted before giving up on failing objects.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Configuration for fetching a dataset.
///
/// # Example
///
/// ```
/// use dsfetch::GetConfig;
///
/// let config = GetConfig {
///     name: "demo/train".to_string(),
///     threads: 8,
///     limit_speed: 1024, // KB/s across all workers
///     ..GetConfig::default()
/// };
/// assert!(config.compressed);
/// ```
#[derive(Debug, Clone)]
pub struct GetConfig {
    /// Dataset name, optionally followed by a sub-path (`"demo/train/images"`).
    pub name: String,
    /// Number of objects downloaded concurrently (default: 10).
    pub threads: usize,
    /// Aggregate bandwidth limit in KB/s; 0 or less disables limiting.
    pub limit_speed: i64,
    /// Download the compressed variant of the dataset (default: true).
    pub compressed: bool,
    /// Parent directory; files land in `output_dir/<dataset>`.
    pub output_dir: PathBuf,
    /// Rounds attempted before reporting the download incomplete (default: 3).
    pub max_rounds: u32,
    /// Pause between rounds (default: 2s).
    pub round_backoff: Duration,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
    /// Per-object transfer tuning.
    pub transfer: TransferOptions,
}

impl Default for GetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            threads: 10,
            limit_speed: 0,
            compressed: true,
            output_dir: PathBuf::from("."),
            max_rounds: DEFAULT_MAX_ROUNDS,
            round_backoff: Duration::from_secs(2),
            show_progress: true,
            transfer: TransferOptions::default(),
        }
    }
}

/// Tuning for a single resumable transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Size of each ranged part.
    pub part_size: u64,
    /// Objects at or above this size use the multipart path.
    pub multipart_threshold: u64,
    /// Parts fetched concurrently for one object.
    ///
    /// Independent of the outer worker count.
    pub part_threads: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_threads: DEFAULT_PART_THREADS,
        }
    }
}

/// An object listed from the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full object key (`org/dataset/raw/file.bin`).
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// ETag reported by storage, quotes stripped.
    pub etag: Option<String>,
}

impl RemoteObject {
    /// Creates an object descriptor.
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            etag: None,
        }
    }

    /// Attaches an ETag.
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Local file name: the last segment of the key.
    pub fn local_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Destination path under `root_dir`.
    pub fn local_path(&self, root_dir: &Path) -> PathBuf {
        root_dir.join(self.local_name())
    }
}

/// One record of the download audit manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// File name shown to the dataset owner.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Result of scanning a dataset prefix.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    /// Objects kept after filtering, in listing order.
    pub objects: Vec<RemoteObject>,
    /// Number of kept objects.
    pub total_files: usize,
    /// Sum of kept object sizes.
    pub total_size: u64,
    /// Audit manifest, one entry per kept object.
    pub manifest: Vec<ManifestEntry>,
}

/// Everything a worker needs to download one object.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Object to fetch.
    pub object: RemoteObject,
    /// Directory the file is written into.
    pub root_dir: PathBuf,
    /// Per-worker traffic limit in bits/s; 0 disables the header.
    pub traffic_limit: u64,
    /// Transfer tuning.
    pub options: TransferOptions,
    /// Progress shared by every worker of the round.
    pub progress: Arc<ProgressTracker>,
}

/// Result of one object download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The object is complete on disk.
    Success,
    /// Storage inconsistency, server or network error.
    Transient(String),
    /// Any other failure.
    Unclassified(String),
}

impl DownloadOutcome {
    /// Whether the object was downloaded.
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadOutcome::Success)
    }
}

/// Terminal state of the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Every object was downloaded.
    Done,
    /// The round budget ran out with objects still failing.
    Exhausted,
}

/// Summary of a retried download.
#[derive(Debug, Clone)]
pub struct RetryReport {
    /// Terminal state.
    pub state: RoundState,
    /// Rounds actually run.
    pub rounds: u32,
    /// Objects still failing (empty when `state` is `Done`).
    pub failed: Vec<RemoteObject>,
}

impl RetryReport {
    /// Whether every object was downloaded.
    pub fn is_complete(&self) -> bool {
        self.state == RoundState::Done
    }
}

/// Final report of [`get_dataset`](crate::get_dataset).
#[derive(Debug, Clone)]
pub struct GetReport {
    /// Dataset name as requested (without sub-path).
    pub dataset: String,
    /// Directory the files were written into.
    pub local_dir: PathBuf,
    /// Number of files selected for download.
    pub total_files: usize,
    /// Bytes selected for download.
    pub total_size: u64,
    /// Outcome of the retry loop.
    pub retry: RetryReport,
    /// Wall time spent downloading.
    pub elapsed: Duration,
}

impl GetReport {
    /// User-facing completion message.
    pub fn message(&self) -> String {
        match self.retry.state {
            RoundState::Done => format!("{}, download completed!", self.dataset),
            RoundState::Exhausted => format!(
                "{}, download incomplete: {} file(s) still failing after {} rounds",
                self.dataset,
                self.retry.failed.len(),
                self.retry.rounds
            ),
        }
    }
}
