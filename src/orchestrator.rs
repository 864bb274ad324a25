//! Main orchestration logic for downloading datasets.

use crate::batch::{dedup_objects, run_batch, BatchContext};
use crate::bucket::{Bucket, BucketSource};
use crate::error::DatasetError;
use crate::listing::{scan_dataset, split_dataset_path};
use crate::metadata::MetadataApi;
use crate::progress::ProgressTracker;
use crate::rate_limit::per_thread_traffic_limit;
use crate::types::{GetConfig, GetReport, RemoteObject, RetryReport, RoundState, TransferOptions};
use async_trait::async_trait;
use indicatif::HumanBytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Link to the user service agreement shown before a first download.
pub const SERVICE_AGREEMENT_URL: &str = "https://opendatalab.com/agreement";

/// Link to the privacy policy shown before a first download.
pub const PRIVACY_POLICY_URL: &str = "https://opendatalab.com/privacy";

/// Interactive confirmations requested during [`get_dataset`].
pub trait Prompter: Send + Sync {
    /// Shows the legal notice; returns whether the user accepts it.
    fn accept_agreement(&self, notice: &str) -> bool;

    /// Asks whether files may be written into `dir`.
    fn confirm_directory(&self, dir: &Path) -> bool;
}

/// Settings for [`download_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Directory the files are written into.
    pub root_dir: PathBuf,
    /// Number of concurrent workers per round.
    pub threads: usize,
    /// Per-worker traffic limit in bits/s.
    pub traffic_limit: u64,
    /// Transfer tuning.
    pub options: TransferOptions,
    /// Rounds attempted before giving up.
    pub max_rounds: u32,
    /// Pause between rounds.
    pub round_backoff: Duration,
    /// Draw a progress bar per round.
    pub show_progress: bool,
}

/// Downloads `objects`, retrying the failed ones in later rounds.
///
/// Each round runs the whole working set through [`run_batch`] with a fresh
/// progress tracker. Between rounds the bucket handle is refreshed through
/// `source` and the orchestrator sleeps for `round_backoff`. The loop stops
/// when a round has no failures ([`RoundState::Done`]) or after
/// `max_rounds` rounds ([`RoundState::Exhausted`]); running out of rounds is
/// reported, not returned as an error.
pub async fn download_with_retry(
    source: &dyn BucketSource,
    bucket: Arc<dyn Bucket>,
    objects: Vec<RemoteObject>,
    ctx: &RetryContext,
) -> RetryReport {
    let max_rounds = ctx.max_rounds.max(1);
    let mut backoff = tokio_retry2::strategy::FixedInterval::from_millis(
        ctx.round_backoff.as_millis() as u64,
    )
    .take(max_rounds as usize - 1);

    let mut bucket = bucket;
    let mut working_set = dedup_objects(objects);
    let mut round = 1;

    loop {
        let round_size: u64 = working_set.iter().map(|o| o.size).sum();
        if round > 1 {
            info!(
                "Retry round {}/{}: {} file(s), {}",
                round,
                max_rounds,
                working_set.len(),
                HumanBytes(round_size)
            );
        }

        let progress = Arc::new(ProgressTracker::new(round_size, ctx.show_progress));
        if round > 1 {
            progress.set_message(format!("retry {}/{}", round - 1, max_rounds - 1));
        }
        let batch = BatchContext {
            root_dir: ctx.root_dir.clone(),
            threads: ctx.threads,
            traffic_limit: ctx.traffic_limit,
            options: ctx.options,
            progress: Arc::clone(&progress),
        };

        let failed = run_batch(Arc::clone(&bucket), &working_set, &batch).await;
        if failed.is_empty() {
            progress.finish(format!("✅ {} file(s) downloaded", working_set.len()));
            return RetryReport {
                state: RoundState::Done,
                rounds: round,
                failed,
            };
        }

        progress.finish(format!("{} file(s) failed", failed.len()));

        let Some(delay) = backoff.next() else {
            warn!(
                "{} file(s) still failing after {} rounds",
                failed.len(),
                round
            );
            return RetryReport {
                state: RoundState::Exhausted,
                rounds: round,
                failed,
            };
        };

        match source.refresh().await {
            Ok(fresh) => bucket = fresh,
            Err(e) => warn!("Failed to refresh bucket handle, reusing the previous one: {}", e),
        }
        working_set = failed;
        tokio::time::sleep(delay).await;
        round += 1;
    }
}

/// Reopens a dataset's bucket through the metadata API.
pub struct DatasetBucketSource<'a> {
    api: &'a dyn MetadataApi,
    dataset: String,
    compressed: bool,
}

impl<'a> DatasetBucketSource<'a> {
    /// Creates a source for `dataset`.
    pub fn new(api: &'a dyn MetadataApi, dataset: impl Into<String>, compressed: bool) -> Self {
        Self {
            api,
            dataset: dataset.into(),
            compressed,
        }
    }
}

#[async_trait]
impl BucketSource for DatasetBucketSource<'_> {
    async fn refresh(&self) -> Result<Arc<dyn Bucket>, DatasetError> {
        let opened = self.api.open_bucket(&self.dataset, self.compressed).await?;
        Ok(opened.bucket)
    }
}

fn agreement_notice() -> String {
    format!(
        "<<User Service Agreement>>: {}\n<<Privacy Policy>>: {}\n[Warning]: Before downloading, please agree above content.",
        SERVICE_AGREEMENT_URL, PRIVACY_POLICY_URL
    )
}

/// Downloads a dataset, or the part of it under a sub-path.
///
/// This is the main entry point. It performs the following steps:
///
/// 1. Resolves the dataset and opens its bucket
/// 2. Lists the files under the requested path
/// 3. Submits the download audit record
/// 4. Asks for the agreement on a first download, and for the target directory
/// 5. Downloads with retry rounds
///
/// # Example
///
/// ```no_run
/// use dsfetch::{get_dataset, ApiClient, GetConfig, Prompter};
/// use std::path::Path;
///
/// struct Yes;
/// impl Prompter for Yes {
///     fn accept_agreement(&self, _notice: &str) -> bool { true }
///     fn confirm_directory(&self, _dir: &Path) -> bool { true }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let api = ApiClient::new(reqwest::Client::new(), "https://opendatalab.com/api", None);
/// let config = GetConfig { name: "demo".to_string(), ..GetConfig::default() };
/// let report = get_dataset(&api, &config, &Yes).await?;
/// println!("{}", report.message());
/// # Ok(())
/// # }
/// ```
pub async fn get_dataset(
    api: &dyn MetadataApi,
    config: &GetConfig,
    prompter: &dyn Prompter,
) -> Result<GetReport, DatasetError> {
    let (dataset, sub_path) = split_dataset_path(&config.name);

    let info = api.dataset_info(dataset).await?;
    let opened = api.open_bucket(&info.name, config.compressed).await?;

    let listing =
        scan_dataset(opened.bucket.as_ref(), &opened.prefix, &config.name, sub_path).await?;

    api.submit_download_audit(dataset, &listing.manifest).await?;
    info!(
        "Scan done, total files: {}, total size: {}",
        listing.total_files,
        HumanBytes(listing.total_size)
    );

    if !api.has_download_record(dataset).await? {
        if !prompter.accept_agreement(&agreement_notice()) {
            return Err(DatasetError::Declined);
        }
        api.record_download(dataset).await?;
    }

    let local_dir = config.output_dir.join(dataset);
    if !prompter.confirm_directory(&local_dir) {
        return Err(DatasetError::Declined);
    }
    if !local_dir.exists() {
        std::fs::create_dir_all(&local_dir)?;
        info!("Created local dir: {}", local_dir.display());
    }

    let ctx = RetryContext {
        root_dir: local_dir.clone(),
        threads: config.threads.max(1),
        traffic_limit: per_thread_traffic_limit(config.limit_speed, config.threads),
        options: config.transfer,
        max_rounds: config.max_rounds,
        round_backoff: config.round_backoff,
        show_progress: config.show_progress,
    };
    let source = DatasetBucketSource::new(api, info.name.clone(), config.compressed);

    let started = Instant::now();
    let retry = download_with_retry(&source, opened.bucket, listing.objects, &ctx).await;
    let elapsed = started.elapsed();
    info!(
        "Download finished in {} after {} round(s)",
        humantime::format_duration(Duration::from_secs(elapsed.as_secs())),
        retry.rounds
    );

    Ok(GetReport {
        dataset: dataset.to_string(),
        local_dir,
        total_files: listing.total_files,
        total_size: listing.total_size,
        retry,
        elapsed,
    })
}
