//! Enumeration and filtering of dataset objects.

use crate::bucket::{Bucket, ObjectSummary};
use crate::error::DatasetError;
use crate::types::{ManifestEntry, ObjectListing, RemoteObject};
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use tracing::debug;

/// Splits `"dataset/sub/path"` into the dataset name and the sub-path.
///
/// # Example
///
/// ```
/// use dsfetch::split_dataset_path;
///
/// assert_eq!(split_dataset_path("demo/train/images"), ("demo", "train/images"));
/// assert_eq!(split_dataset_path("demo"), ("demo", ""));
/// ```
pub fn split_dataset_path(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((dataset, sub_path)) => (dataset, sub_path),
        None => (name, ""),
    }
}

/// Path of a key relative to the dataset: the organization and dataset
/// segments are dropped.
pub(crate) fn dataset_relative_path(key: &str) -> String {
    key.split('/').skip(2).collect::<Vec<_>>().join("/")
}

enum Cursor {
    Start,
    Next(String),
    End,
}

async fn next_page(
    bucket: &dyn Bucket,
    prefix: &str,
    cursor: Cursor,
) -> Result<Option<(Vec<ObjectSummary>, Cursor)>, DatasetError> {
    let continuation = match cursor {
        Cursor::Start => None,
        Cursor::Next(token) => Some(token),
        Cursor::End => return Ok(None),
    };
    let page = bucket.list_page(prefix, continuation.as_deref()).await?;
    let next = match page.next_continuation {
        Some(token) => Cursor::Next(token),
        None => Cursor::End,
    };
    Ok(Some((page.entries, next)))
}

/// Lists every object under `prefix`, following continuation tokens lazily.
///
/// Each call starts a new listing, so a stream abandoned half-way can be
/// restarted against a fresh bucket handle.
pub fn list_objects<'a>(
    bucket: &'a dyn Bucket,
    prefix: &'a str,
) -> impl Stream<Item = Result<ObjectSummary, DatasetError>> + Send + 'a {
    stream::try_unfold(Cursor::Start, move |cursor| next_page(bucket, prefix, cursor))
        .map_ok(|entries| stream::iter(entries).map(Ok::<_, DatasetError>))
        .try_flatten()
}

/// Scans `prefix` and keeps the files under `sub_path`.
///
/// Directory markers and prefix placeholders are skipped. `name` is only
/// used in the not-found message.
pub async fn scan_dataset(
    bucket: &dyn Bucket,
    prefix: &str,
    name: &str,
    sub_path: &str,
) -> Result<ObjectListing, DatasetError> {
    let mut listing = ObjectListing::default();
    let mut entries = std::pin::pin!(list_objects(bucket, prefix));

    while let Some(summary) = entries.try_next().await? {
        if summary.is_prefix || summary.key.ends_with('/') {
            continue;
        }

        let relative = dataset_relative_path(&summary.key);
        if !sub_path.is_empty() && !relative.starts_with(sub_path) {
            continue;
        }

        let mut object = RemoteObject::new(summary.key, summary.size);
        if let Some(etag) = summary.etag {
            object = object.with_etag(etag.trim_matches('"'));
        }

        listing.total_files += 1;
        listing.total_size += object.size;
        listing.manifest.push(ManifestEntry {
            name: object.local_name().to_string(),
            size: object.size,
        });
        listing.objects.push(object);
    }

    if listing.objects.is_empty() {
        return Err(DatasetError::NotFound(format!("{} not exists!", name)));
    }

    debug!(
        "Scanned '{}': {} files, {} bytes",
        prefix, listing.total_files, listing.total_size
    );
    Ok(listing)
}
