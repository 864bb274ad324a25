//! HTTP implementation of the bucket capability.

use crate::bucket::{Bucket, ObjectPage, ObjectSummary, TransferRequest};
use crate::error::{DatasetError, TransferError};
use crate::transfer;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Where a dataset's objects live and how to reach them.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    /// Bucket endpoint; object URLs are `{endpoint}/{key}`.
    pub endpoint: String,
    /// Key prefix holding the dataset files.
    pub prefix: String,
    /// Short-lived access token, if the bucket is not public.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ListPageResponse {
    #[serde(default)]
    objects: Vec<ObjectSummary>,
    #[serde(default)]
    common_prefixes: Vec<String>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

/// A bucket reached over plain HTTP with ranged GETs.
#[derive(Debug, Clone)]
pub struct HttpBucket {
    client: Client,
    endpoint: String,
    auth: HeaderMap,
}

impl HttpBucket {
    /// Creates a handle from a resolved storage location.
    pub fn new(client: Client, location: &StorageLocation) -> Result<Self, DatasetError> {
        let mut auth = HeaderMap::new();
        if let Some(token) = &location.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| DatasetError::Storage(format!("Invalid storage token: {}", e)))?;
            auth.insert(AUTHORIZATION, value);
        }
        Ok(Self {
            client,
            endpoint: location.endpoint.trim_end_matches('/').to_string(),
            auth,
        })
    }

    /// URL of an object.
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Bucket for HttpBucket {
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, DatasetError> {
        let mut query = vec![("list-type", "2"), ("prefix", prefix)];
        if let Some(token) = continuation {
            query.push(("continuation-token", token));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .headers(self.auth.clone())
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DatasetError::Storage(format!(
                "Listing {} under '{}' failed: HTTP {}",
                self.endpoint, prefix, status
            )));
        }

        let page: ListPageResponse = response.json().await?;
        debug!(
            "Listed {} objects and {} prefixes under '{}'",
            page.objects.len(),
            page.common_prefixes.len(),
            prefix
        );

        let mut entries = page.objects;
        entries.extend(page.common_prefixes.into_iter().map(|key| ObjectSummary {
            key,
            size: 0,
            etag: None,
            is_prefix: true,
        }));

        Ok(ObjectPage {
            entries,
            next_continuation: page.next_continuation_token.filter(|t| !t.is_empty()),
        })
    }

    async fn resumable_download(
        &self,
        mut request: TransferRequest<'_>,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), TransferError> {
        for (name, value) in self.auth.iter() {
            request.headers.insert(name.clone(), value.clone());
        }
        let url = self.object_url(request.key);
        transfer::resumable_download(&self.client, &url, &request, on_progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url() {
        let bucket = HttpBucket::new(
            Client::new(),
            &StorageLocation {
                endpoint: "https://bucket.example.com/".to_string(),
                prefix: "org/demo/".to_string(),
                token: Some("secret".to_string()),
            },
        )
        .unwrap();
        assert_eq!(
            bucket.object_url("org/demo/raw/a.bin"),
            "https://bucket.example.com/org/demo/raw/a.bin"
        );
        assert_eq!(
            bucket.auth.get(AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("Bearer secret")
        );
    }

    #[test]
    fn test_location_deserialize() {
        let location: StorageLocation =
            serde_json::from_str(r#"{"endpoint":"http://s","prefix":"o/d/"}"#).unwrap();
        assert_eq!(location.token, None);
        assert_eq!(location.prefix, "o/d/");
    }
}
