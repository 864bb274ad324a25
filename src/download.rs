//! Single object download.

use crate::bucket::{Bucket, TransferRequest};
use crate::rate_limit::TRAFFIC_LIMIT_HEADER;
use crate::types::{DownloadOutcome, DownloadTask};
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

/// Downloads `task.object` into `task.root_dir` and classifies the result.
///
/// Errors never escape: they are logged and returned as
/// [`DownloadOutcome::Transient`] or [`DownloadOutcome::Unclassified`]. The
/// partial data stays on disk so the next attempt resumes it.
pub async fn download_object(bucket: &dyn Bucket, task: &DownloadTask) -> DownloadOutcome {
    let object = &task.object;
    let dest = object.local_path(&task.root_dir);

    let mut headers = HeaderMap::new();
    if task.traffic_limit > 0 {
        headers.insert(TRAFFIC_LIMIT_HEADER, HeaderValue::from(task.traffic_limit));
    }

    let request = TransferRequest {
        key: &object.key,
        size: object.size,
        etag: object.etag.as_deref(),
        dest: &dest,
        options: task.options,
        headers,
    };

    let progress = &task.progress;
    let key = object.key.as_str();
    let on_progress = move |consumed: u64| progress.record(key, consumed);

    debug!("Downloading {} -> {}", object.key, dest.display());
    match bucket.resumable_download(request, &on_progress).await {
        Ok(()) => DownloadOutcome::Success,
        Err(e) if e.is_transient() => {
            warn!("Transient failure downloading {}: {}", object.key, e);
            DownloadOutcome::Transient(e.to_string())
        }
        Err(e) => {
            warn!("Unexpected failure downloading {}: {}", object.key, e);
            DownloadOutcome::Unclassified(e.to_string())
        }
    }
}
