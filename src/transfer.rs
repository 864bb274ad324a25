//! Resumable ranged transfer of one object over HTTP.
//!
//! Small objects are fetched with a single request that resumes from the
//! length of the temporary file. Objects at or above the multipart threshold
//! are split into fixed-size parts fetched concurrently; finished parts are
//! recorded in a JSON checkpoint next to the temporary file so a later
//! attempt only fetches what is missing. Both sidecar files carry a hash of
//! the key, so objects sharing a basename never write into the same file.

use crate::bucket::TransferRequest;
use crate::error::TransferError;
use crate::verify::{is_complete, verify_etag};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, IF_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Progress of a multipart transfer, persisted between attempts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    key: String,
    size: u64,
    etag: Option<String>,
    part_size: u64,
    parts_done: Vec<bool>,
}

impl Checkpoint {
    fn new(request: &TransferRequest<'_>) -> Self {
        let part_size = request.options.part_size.max(1);
        let parts = request.size.div_ceil(part_size) as usize;
        Self {
            key: request.key.to_string(),
            size: request.size,
            etag: request.etag.map(str::to_string),
            part_size,
            parts_done: vec![false; parts],
        }
    }

    fn matches(&self, fresh: &Checkpoint) -> bool {
        self.key == fresh.key
            && self.size == fresh.size
            && self.etag == fresh.etag
            && self.part_size == fresh.part_size
            && self.parts_done.len() == fresh.parts_done.len()
    }

    fn part_range(&self, index: usize) -> (u64, u64) {
        let start = index as u64 * self.part_size;
        let end = (start + self.part_size).min(self.size);
        (start, end)
    }

    fn done_bytes(&self) -> u64 {
        self.parts_done
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(i, _)| {
                let (start, end) = self.part_range(i);
                end - start
            })
            .sum()
    }

    fn pending(&self) -> Vec<usize> {
        self.parts_done
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Sidecar file next to `dest`, named after the object's key.
///
/// Keys sharing a basename land on the same `dest`; hashing the key keeps
/// their partial data apart until the final rename.
fn sidecar_path(dest: &Path, key: &str, suffix: &str) -> PathBuf {
    use md5::{Digest, Md5};

    let digest = format!("{:x}", Md5::digest(key.as_bytes()));
    let mut name = dest.as_os_str().to_os_string();
    name.push(format!(".{}{}", &digest[..8], suffix));
    PathBuf::from(name)
}

/// Temporary file holding partial data of `key` for `dest`.
pub fn temp_path(dest: &Path, key: &str) -> PathBuf {
    sidecar_path(dest, key, ".tmp")
}

/// Checkpoint file of `key` for `dest`.
pub fn checkpoint_path(dest: &Path, key: &str) -> PathBuf {
    sidecar_path(dest, key, ".dcp")
}

fn check_status(status: StatusCode) -> Result<(), TransferError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
        Err(TransferError::Inconsistent(
            "requested range not satisfiable".to_string(),
        ))
    } else if status.is_server_error() {
        Err(TransferError::Server {
            status: status.as_u16(),
        })
    } else {
        Err(TransferError::Status {
            status: status.as_u16(),
        })
    }
}

async fn send_range(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    range: String,
) -> Result<Response, TransferError> {
    let response = client
        .get(url)
        .headers(headers.clone())
        .header(RANGE, range)
        .send()
        .await?;
    check_status(response.status())?;
    Ok(response)
}

/// `If-Range` value for resuming `request`, when its ETag is known.
fn if_range(request: &TransferRequest<'_>) -> Option<HeaderValue> {
    let etag = request.etag?.trim_matches('"');
    if etag.is_empty() {
        return None;
    }
    HeaderValue::from_str(&format!("\"{}\"", etag)).ok()
}

async fn send_resume(
    client: &Client,
    url: &str,
    request: &TransferRequest<'_>,
    offset: u64,
) -> Result<Response, TransferError> {
    let mut builder = client
        .get(url)
        .headers(request.headers.clone())
        .header(RANGE, format!("bytes={}-", offset));
    if offset > 0 {
        if let Some(value) = if_range(request) {
            builder = builder.header(IF_RANGE, value);
        }
    }
    let response = builder.send().await?;
    check_status(response.status())?;
    Ok(response)
}

/// Downloads `request.key` from `url` into `request.dest`.
pub(crate) async fn resumable_download(
    client: &Client,
    url: &str,
    request: &TransferRequest<'_>,
    on_progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<(), TransferError> {
    let dest = request.dest;
    if is_complete(dest, request.size, request.etag).await? {
        on_progress(request.size);
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(dest, request.key);
    let checkpoint = checkpoint_path(dest, request.key);

    if request.size < request.options.multipart_threshold {
        download_single(client, url, request, &tmp, on_progress).await?;
    } else {
        match download_multipart(client, url, request, &tmp, &checkpoint, on_progress).await {
            Err(TransferError::RangeIgnored) => {
                warn!(
                    "Storage ignored ranged requests for {}, fetching it in one request",
                    request.key
                );
                let _ = tokio::fs::remove_file(&checkpoint).await;
                let _ = tokio::fs::remove_file(&tmp).await;
                download_single(client, url, request, &tmp, on_progress).await?;
            }
            other => other?,
        }
    }

    if let Err(e) = verify_etag(&tmp, request.etag).await {
        warn!("Discarding corrupt data for {}: {}", request.key, e);
        let _ = tokio::fs::remove_file(&tmp).await;
        let _ = tokio::fs::remove_file(&checkpoint).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp, dest).await?;
    let _ = tokio::fs::remove_file(&checkpoint).await;
    debug!("Finished {} -> {}", request.key, dest.display());
    Ok(())
}

async fn download_single(
    client: &Client,
    url: &str,
    request: &TransferRequest<'_>,
    tmp: &Path,
    on_progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<(), TransferError> {
    let size = request.size;
    let mut offset = match tokio::fs::metadata(tmp).await {
        Ok(m) if m.len() <= size => m.len(),
        Ok(_) => {
            tokio::fs::remove_file(tmp).await?;
            0
        }
        Err(_) => 0,
    };

    if offset == size {
        if size == 0 {
            tokio::fs::File::create(tmp).await?;
        }
        on_progress(size);
        return Ok(());
    }

    if offset > 0 {
        info!("Resuming {} from byte {}", request.key, offset);
    }

    let response = send_resume(client, url, request, offset).await?;

    let file = if response.status() == StatusCode::PARTIAL_CONTENT && offset > 0 {
        let mut f = tokio::fs::OpenOptions::new().write(true).open(tmp).await?;
        f.seek(std::io::SeekFrom::Start(offset)).await?;
        f
    } else {
        // Range ignored, or the object changed since the partial data was written.
        offset = 0;
        tokio::fs::File::create(tmp).await?
    };

    on_progress(offset);
    let mut writer = BufWriter::new(file);
    let mut received = offset;
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let chunk = piece?;
        writer.write_all(&chunk).await?;
        received += chunk.len() as u64;
        on_progress(received);
    }
    writer.flush().await?;

    if received != size {
        return Err(TransferError::Inconsistent(format!(
            "Size mismatch for {}: expected {} bytes, got {} bytes",
            request.key, size, received
        )));
    }
    Ok(())
}

async fn load_checkpoint(
    request: &TransferRequest<'_>,
    tmp: &Path,
    checkpoint_file: &Path,
) -> Result<Checkpoint, TransferError> {
    let fresh = Checkpoint::new(request);

    let tmp_ok = matches!(tokio::fs::metadata(tmp).await, Ok(m) if m.len() == request.size);
    if tmp_ok {
        if let Ok(content) = tokio::fs::read_to_string(checkpoint_file).await {
            match serde_json::from_str::<Checkpoint>(&content) {
                Ok(saved) if saved.matches(&fresh) => {
                    info!(
                        "Resuming {} with {}/{} parts done",
                        request.key,
                        saved.parts_done.iter().filter(|d| **d).count(),
                        saved.parts_done.len()
                    );
                    return Ok(saved);
                }
                Ok(_) => info!("Checkpoint for {} is stale, restarting", request.key),
                Err(e) => warn!("Unreadable checkpoint for {}: {}", request.key, e),
            }
        }
    }

    let file = tokio::fs::File::create(tmp).await?;
    file.set_len(request.size).await?;
    save_checkpoint(checkpoint_file, &fresh).await?;
    Ok(fresh)
}

async fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<(), TransferError> {
    let json = serde_json::to_vec(checkpoint)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

async fn download_multipart(
    client: &Client,
    url: &str,
    request: &TransferRequest<'_>,
    tmp: &Path,
    checkpoint_file: &Path,
    on_progress: &(dyn Fn(u64) + Send + Sync),
) -> Result<(), TransferError> {
    let mut checkpoint = load_checkpoint(request, tmp, checkpoint_file).await?;
    let consumed = AtomicU64::new(checkpoint.done_bytes());
    on_progress(consumed.load(Ordering::SeqCst));

    let ranges: Vec<(usize, u64, u64)> = checkpoint
        .pending()
        .into_iter()
        .map(|i| {
            let (start, end) = checkpoint.part_range(i);
            (i, start, end)
        })
        .collect();

    let consumed_ref = &consumed;
    let mut parts = futures_util::stream::iter(ranges)
        .map(|(index, start, end)| async move {
            fetch_part(client, url, &request.headers, tmp, start, end, |n| {
                let total = consumed_ref.fetch_add(n, Ordering::SeqCst) + n;
                on_progress(total);
            })
            .await
            .map(|_| index)
        })
        .buffer_unordered(request.options.part_threads.max(1));

    while let Some(result) = parts.next().await {
        let index = result?;
        checkpoint.parts_done[index] = true;
        save_checkpoint(checkpoint_file, &checkpoint).await?;
    }

    Ok(())
}

async fn fetch_part(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    tmp: &Path,
    start: u64,
    end: u64,
    on_bytes: impl Fn(u64),
) -> Result<(), TransferError> {
    let response = send_range(client, url, headers, format!("bytes={}-{}", start, end - 1)).await?;
    if response.status() == StatusCode::OK {
        return Err(TransferError::RangeIgnored);
    }
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(TransferError::Inconsistent(format!(
            "expected partial content for range {}-{}, got HTTP {}",
            start,
            end - 1,
            response.status()
        )));
    }

    let mut file = tokio::fs::OpenOptions::new().write(true).open(tmp).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut writer = BufWriter::new(file);

    let expected = end - start;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let chunk = piece?;
        if written + chunk.len() as u64 > expected {
            return Err(TransferError::Inconsistent(format!(
                "range {}-{} returned more than {} bytes",
                start,
                end - 1,
                expected
            )));
        }
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_bytes(chunk.len() as u64);
    }
    writer.flush().await?;

    if written != expected {
        return Err(TransferError::Inconsistent(format!(
            "range {}-{} returned {} of {} bytes",
            start,
            end - 1,
            written,
            expected
        )));
    }
    Ok(())
}
