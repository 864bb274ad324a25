//! Object storage capability consumed by the download engine.

use crate::error::{DatasetError, TransferError};
use crate::types::TransferOptions;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// One entry of a bucket listing.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// ETag, possibly quoted.
    #[serde(default)]
    pub etag: Option<String>,
    /// Set for common-prefix placeholders.
    #[serde(default)]
    pub is_prefix: bool,
}

/// A page of listing results.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    /// Entries on this page.
    pub entries: Vec<ObjectSummary>,
    /// Token for the next page, `None` on the last one.
    pub next_continuation: Option<String>,
}

/// A request to bring one object onto local disk.
#[derive(Debug)]
pub struct TransferRequest<'a> {
    /// Object key.
    pub key: &'a str,
    /// Expected size in bytes.
    pub size: u64,
    /// Listed ETag, if any.
    pub etag: Option<&'a str>,
    /// Final local path.
    pub dest: &'a Path,
    /// Part size, multipart threshold and part parallelism.
    pub options: TransferOptions,
    /// Extra headers sent with every object request.
    pub headers: HeaderMap,
}

/// A handle on the bucket that stores a dataset.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Lists one page of objects under `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, DatasetError>;

    /// Downloads an object, resuming any partial data left by an earlier attempt.
    ///
    /// `on_progress` receives the cumulative number of bytes of the object
    /// present locally, starting from the resumed offset.
    async fn resumable_download(
        &self,
        request: TransferRequest<'_>,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), TransferError>;
}

/// Produces fresh bucket handles, re-resolving credentials each time.
#[async_trait]
pub trait BucketSource: Send + Sync {
    /// Returns a new handle on the bucket.
    async fn refresh(&self) -> Result<Arc<dyn Bucket>, DatasetError>;
}
