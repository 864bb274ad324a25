//! Metadata API access: dataset resolution, storage handles and download records.

use crate::bucket::Bucket;
use crate::error::DatasetError;
use crate::storage::{HttpBucket, StorageLocation};
use crate::types::ManifestEntry;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_retry2::{Retry, RetryError};
use tracing::{info, warn};

/// Dataset description returned by the API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    /// Canonical dataset name.
    pub name: String,
}

/// A bucket handle together with the prefix holding the dataset.
#[derive(Clone)]
pub struct OpenedBucket {
    /// Handle on the bucket.
    pub bucket: Arc<dyn Bucket>,
    /// Key prefix of the dataset files.
    pub prefix: String,
}

impl std::fmt::Debug for OpenedBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBucket")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Calls the download flow needs from the metadata service.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Resolves a user-supplied name to the dataset's canonical description.
    async fn dataset_info(&self, name: &str) -> Result<DatasetInfo, DatasetError>;

    /// Resolves fresh storage credentials for a dataset.
    ///
    /// Called again before each retry round, since credentials may expire
    /// during long downloads.
    async fn open_bucket(&self, dataset: &str, compressed: bool)
        -> Result<OpenedBucket, DatasetError>;

    /// Reports which files are about to be downloaded.
    async fn submit_download_audit(
        &self,
        dataset: &str,
        manifest: &[ManifestEntry],
    ) -> Result<(), DatasetError>;

    /// Whether the user has downloaded this dataset before.
    async fn has_download_record(&self, dataset: &str) -> Result<bool, DatasetError>;

    /// Records that the user accepted the agreement and downloaded the dataset.
    async fn record_download(&self, dataset: &str) -> Result<(), DatasetError>;
}

#[derive(Deserialize, Debug)]
struct DownloadRecord {
    downloaded: bool,
}

/// HTTP client for the metadata API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry_interval_ms: u64,
    retries: usize,
}

impl ApiClient {
    /// Creates a client for `base_url`, authenticating with `token` when set.
    pub fn new(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            retry_interval_ms: 1_000,
            retries: 2,
        }
    }

    /// Overrides the retry schedule of idempotent requests.
    pub fn with_retries(mut self, retries: usize, interval_ms: u64) -> Self {
        self.retries = retries;
        self.retry_interval_ms = interval_ms;
        self
    }

    fn dataset_url(&self, dataset: &str, path: &str) -> String {
        format!("{}/datasets/{}{}", self.base_url, dataset, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(
        response: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response, DatasetError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(DatasetError::NotFound(format!("{} not exists!", url)));
        }
        Err(DatasetError::Api {
            status: status.as_u16(),
            message: if body.is_empty() { url.to_string() } else { body },
        })
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, DatasetError> {
        let response = self
            .authorized(self.client.get(url).query(query))
            .send()
            .await?;
        let response = Self::check(response, url).await?;
        Ok(response.json::<T>().await?)
    }

    /// GET with a fixed-interval retry on connection failures and 5xx answers.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, DatasetError> {
        let strategy = tokio_retry2::strategy::FixedInterval::from_millis(self.retry_interval_ms)
            .take(self.retries);

        Retry::spawn(strategy, || async move {
            match self.get_json_once::<T>(url, query).await {
                Ok(value) => Ok(value),
                Err(e) if is_retryable(&e) => {
                    warn!("Request to {} failed, retrying: {}", url, e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        })
        .await
    }

    async fn post_json<B: Serialize + ?Sized + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(), DatasetError> {
        let response = self
            .authorized(self.client.post(url).json(body))
            .send()
            .await?;
        Self::check(response, url).await?;
        Ok(())
    }

    /// Resolves where a dataset's files are stored.
    pub async fn storage_location(
        &self,
        dataset: &str,
        compressed: bool,
    ) -> Result<StorageLocation, DatasetError> {
        let url = self.dataset_url(dataset, "/storage");
        self.get_json(&url, &[("compressed", compressed.to_string())]).await
    }
}

fn is_retryable(error: &DatasetError) -> bool {
    match error {
        DatasetError::ReqwestError(e) => e.is_connect() || e.is_timeout(),
        DatasetError::Api { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl MetadataApi for ApiClient {
    async fn dataset_info(&self, name: &str) -> Result<DatasetInfo, DatasetError> {
        let url = self.dataset_url(name, "");
        info!("Retrieving dataset info from {}", url);
        self.get_json(&url, &[]).await.map_err(|e| match e {
            DatasetError::NotFound(_) => DatasetError::NotFound(format!("{} not exists!", name)),
            other => other,
        })
    }

    async fn open_bucket(
        &self,
        dataset: &str,
        compressed: bool,
    ) -> Result<OpenedBucket, DatasetError> {
        let location = self.storage_location(dataset, compressed).await?;
        let bucket = HttpBucket::new(self.client.clone(), &location)?;
        Ok(OpenedBucket {
            bucket: Arc::new(bucket),
            prefix: location.prefix,
        })
    }

    async fn submit_download_audit(
        &self,
        dataset: &str,
        manifest: &[ManifestEntry],
    ) -> Result<(), DatasetError> {
        let url = self.dataset_url(dataset, "/download-log");
        self.post_json(&url, manifest).await
    }

    async fn has_download_record(&self, dataset: &str) -> Result<bool, DatasetError> {
        let url = self.dataset_url(dataset, "/download-record");
        let record: DownloadRecord = self.get_json(&url, &[]).await?;
        Ok(record.downloaded)
    }

    async fn record_download(&self, dataset: &str) -> Result<(), DatasetError> {
        let url = self.dataset_url(dataset, "/download-record");
        self.post_json(&url, &serde_json::json!({})).await
    }
}
