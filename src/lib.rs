//! dsfetch - Concurrent, resumable dataset downloader for object storage
//!
//! This library lists the files of a dataset stored in an object-storage
//! bucket and downloads them concurrently with resumable, rate-limited
//! transfers, retrying failed files in bounded rounds.
//!
//! # Features
//!
//! - **Resumable Downloads**: Partial files and multipart checkpoints survive failures
//! - **Bandwidth Limits**: Aggregate speed limits split evenly across workers
//! - **Bounded Concurrency**: A fixed pool of workers per round
//! - **Retry Rounds**: Failed files are retried with a refreshed bucket handle
//! - **MD5 Verification**: Simple-upload ETags are checked after each transfer
//!
//! # Example
//!
//! ```no_run
//! use dsfetch::{download_with_retry, BucketSource, RemoteObject, RetryContext, TransferOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(source: &dyn BucketSource) -> Result<(), Box<dyn std::error::Error>> {
//! let bucket = source.refresh().await?;
//! let objects = vec![RemoteObject::new("org/demo/raw/a.bin", 1024)];
//! let ctx = RetryContext {
//!     root_dir: "demo".into(),
//!     threads: 4,
//!     traffic_limit: 0,
//!     options: TransferOptions::default(),
//!     max_rounds: 3,
//!     round_backoff: Duration::from_secs(2),
//!     show_progress: true,
//! };
//! let report = download_with_retry(source, bucket, objects, &ctx).await;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```

mod batch;
mod bucket;
mod download;
mod error;
mod listing;
mod metadata;
mod orchestrator;
mod progress;
mod rate_limit;
mod storage;
mod transfer;
mod types;
mod verify;

pub use batch::{dedup_objects, run_batch, BatchContext};
pub use bucket::{Bucket, BucketSource, ObjectPage, ObjectSummary, TransferRequest};
pub use download::download_object;
pub use error::{DatasetError, TransferError};
pub use listing::{list_objects, scan_dataset, split_dataset_path};
pub use metadata::{ApiClient, DatasetInfo, MetadataApi, OpenedBucket};
pub use orchestrator::{
    download_with_retry, get_dataset, DatasetBucketSource, Prompter, RetryContext,
    PRIVACY_POLICY_URL, SERVICE_AGREEMENT_URL,
};
pub use progress::ProgressTracker;
pub use rate_limit::{
    per_thread_traffic_limit, traffic_limit, MAX_TRAFFIC_LIMIT, MIN_TRAFFIC_LIMIT,
    TRAFFIC_LIMIT_HEADER,
};
pub use storage::{HttpBucket, StorageLocation};
pub use transfer::{checkpoint_path, temp_path};
pub use types::{
    DownloadOutcome, DownloadTask, GetConfig, GetReport, ManifestEntry, ObjectListing,
    RemoteObject, RetryReport, RoundState, TransferOptions, DEFAULT_MAX_ROUNDS,
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE, DEFAULT_PART_THREADS,
};
