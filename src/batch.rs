//! Concurrent download of one batch of objects.

use crate::bucket::Bucket;
use crate::download::download_object;
use crate::progress::ProgressTracker;
use crate::types::{DownloadOutcome, DownloadTask, RemoteObject, TransferOptions};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Settings shared by every download of a batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    /// Directory the files are written into.
    pub root_dir: PathBuf,
    /// Number of concurrent workers.
    pub threads: usize,
    /// Per-worker traffic limit in bits/s.
    pub traffic_limit: u64,
    /// Transfer tuning.
    pub options: TransferOptions,
    /// Progress for this batch.
    pub progress: Arc<ProgressTracker>,
}

/// Removes repeated keys, keeping the first occurrence.
pub fn dedup_objects(objects: Vec<RemoteObject>) -> Vec<RemoteObject> {
    let mut seen = HashSet::new();
    objects
        .into_iter()
        .filter(|o| seen.insert(o.key.clone()))
        .collect()
}

/// Downloads `objects` with at most `ctx.threads` in flight and returns the
/// ones that failed.
///
/// A failure never cancels the other downloads. Failures are collected in
/// completion order and deduplicated by key.
pub async fn run_batch(
    bucket: Arc<dyn Bucket>,
    objects: &[RemoteObject],
    ctx: &BatchContext,
) -> Vec<RemoteObject> {
    let semaphore = Arc::new(Semaphore::new(ctx.threads.max(1)));
    let mut workers = JoinSet::new();

    for object in objects {
        let task = DownloadTask {
            object: object.clone(),
            root_dir: ctx.root_dir.clone(),
            traffic_limit: ctx.traffic_limit,
            options: ctx.options,
            progress: Arc::clone(&ctx.progress),
        };
        let semaphore = Arc::clone(&semaphore);
        let bucket = Arc::clone(&bucket);

        workers.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => download_object(bucket.as_ref(), &task).await,
                Err(e) => DownloadOutcome::Unclassified(e.to_string()),
            };
            (task.object, outcome)
        });
    }

    let mut failed = Vec::new();
    let mut completed: HashSet<String> = HashSet::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((object, outcome)) => {
                completed.insert(object.key.clone());
                if !outcome.is_success() {
                    failed.push(object);
                }
            }
            Err(e) => error!("Download worker failed: {}", e),
        }
    }

    // A panicked worker never reports its object; treat it as failed.
    for object in objects {
        if !completed.contains(&object.key) {
            failed.push(object.clone());
        }
    }

    let failed = dedup_objects(failed);
    info!(
        "Batch finished: {} succeeded, {} failed",
        objects.len() - failed.len().min(objects.len()),
        failed.len()
    );
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_seen_order() {
        let objects = vec![
            RemoteObject::new("o/d/b", 2),
            RemoteObject::new("o/d/a", 1),
            RemoteObject::new("o/d/b", 2),
            RemoteObject::new("o/d/c", 3),
            RemoteObject::new("o/d/a", 1),
        ];
        let keys: Vec<_> = dedup_objects(objects).into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["o/d/b", "o/d/a", "o/d/c"]);
    }
}
