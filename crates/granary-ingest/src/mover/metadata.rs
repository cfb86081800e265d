//! Descriptive-metadata refresh after a move
//!
//! Parsing and rewriting the metadata documents lives outside this crate.
//! The move engine only hands the final file locations to a
//! [`MetadataUpdater`] and records the online-access URLs it returns.

use async_trait::async_trait;
use granary_common::{GranaryError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::store::store_uri;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub bucket: String,
    pub key: String,
}

/// Request sent to the metadata collaborator once every file has moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    pub granule_id: String,
    pub files: Vec<FileLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_endpoint: Option<String>,
    /// The collaborator must also re-submit the granule to the catalog
    pub published: bool,
}

#[async_trait]
pub trait MetadataUpdater: Send + Sync {
    /// Rewrite the granule's metadata and return its online-access URLs
    async fn update(&self, request: &MetadataUpdate) -> Result<Vec<String>>;
}

/// Distribution URL of an object: `<endpoint>/<bucket>/<key>`
pub fn online_access_url(endpoint: &str, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key)
}

/// Computes online-access URLs locally without touching any catalog
#[derive(Debug, Default, Clone, Copy)]
pub struct DistributionUrlUpdater;

#[async_trait]
impl MetadataUpdater for DistributionUrlUpdater {
    async fn update(&self, request: &MetadataUpdate) -> Result<Vec<String>> {
        if request.published {
            warn!(granule_id = %request.granule_id, "Granule is published but no catalog collaborator is configured");
        }
        Ok(request
            .files
            .iter()
            .map(|file| match request.distribution_endpoint.as_deref() {
                Some(endpoint) => online_access_url(endpoint, &file.bucket, &file.key),
                None => store_uri(&file.bucket, &file.key),
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataUpdateResponse {
    online_access_urls: Vec<String>,
}

/// Posts the request as JSON to an external metadata service
#[derive(Debug, Clone)]
pub struct HttpMetadataUpdater {
    client: Client,
    url: String,
}

impl HttpMetadataUpdater {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GranaryError::Config(format!("Failed to build metadata client: {}", e)))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl MetadataUpdater for HttpMetadataUpdater {
    #[instrument(skip(self, request), fields(granule_id = %request.granule_id, url = %self.url))]
    async fn update(&self, request: &MetadataUpdate) -> Result<Vec<String>> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| GranaryError::RemoteResource(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GranaryError::Transport(format!(
                "Metadata update for {} failed with status code {}",
                request.granule_id,
                status.as_u16()
            )));
        }

        let body: MetadataUpdateResponse = response
            .json()
            .await
            .map_err(|e| GranaryError::Transport(format!("Invalid metadata update response: {}", e)))?;
        info!(urls = body.online_access_urls.len(), "Metadata updated");
        Ok(body.online_access_urls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(published: bool) -> MetadataUpdate {
        MetadataUpdate {
            granule_id: "G1".into(),
            files: vec![FileLocation { bucket: "public".into(), key: "browse/G1.jpg".into() }],
            distribution_endpoint: Some("https://dist.example.com/".into()),
            published,
        }
    }

    #[tokio::test]
    async fn test_distribution_urls() {
        let urls = DistributionUrlUpdater.update(&request(false)).await.unwrap();
        assert_eq!(urls, vec!["https://dist.example.com/public/browse/G1.jpg"]);

        let mut no_endpoint = request(false);
        no_endpoint.distribution_endpoint = None;
        let urls = DistributionUrlUpdater.update(&no_endpoint).await.unwrap();
        assert_eq!(urls, vec!["s3://public/browse/G1.jpg"]);
    }

    #[tokio::test]
    async fn test_http_updater_posts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metadata"))
            .and(body_partial_json(serde_json::json!({"granuleId": "G1", "published": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"onlineAccessUrls": ["https://dist/x"]})),
            )
            .mount(&server)
            .await;

        let updater =
            HttpMetadataUpdater::new(format!("{}/metadata", server.uri()), Duration::from_secs(5)).unwrap();
        let urls = updater.update(&request(true)).await.unwrap();
        assert_eq!(urls, vec!["https://dist/x"]);
    }

    #[tokio::test]
    async fn test_http_updater_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let updater = HttpMetadataUpdater::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = updater.update(&request(false)).await.unwrap_err();
        assert!(err.to_string().contains("G1"));
    }
}
