//! Provider clients
//!
//! One [`ProviderClient`] implementation per remote protocol. Each exposes the
//! same three operations: listing, whole-file download of small control files,
//! and streamed sync straight into the managed object store. Failures are
//! normalized into [`GranaryError`] kinds before they leave a client.

use async_trait::async_trait;
use granary_common::types::FileDescriptor;
use granary_common::{GranaryError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::{store_uri, BodyStream, ObjectStore};

pub mod credentials;
pub mod ftp;
pub mod http;
pub mod object_store;
pub mod sftp;
mod stream;

pub use credentials::{CredentialDecryptor, Credentials, KeyPairDecryptor, KmsDecryptor};
pub use ftp::FtpProviderClient;
pub use http::HttpProviderClient;
pub use object_store::ObjectStoreProviderClient;
pub use sftp::SftpProviderClient;

/// Retries granted to a listing that failed with a transport timeout
pub const LIST_TIMEOUT_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Sftp,
    Http,
    Https,
    S3,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::S3 => "s3",
        };
        f.write_str(name)
    }
}

/// Provider record as stored by the providers API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub protocol: Protocol,
    /// Hostname, or the source bucket for object-storage providers
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Username and password are ciphertext
    #[serde(default)]
    pub encrypted: bool,
    /// Private key file name under `<stack>/crypto/` in the system bucket
    #[serde(default)]
    pub private_key: Option<String>,
    /// Set when the private key file is itself KMS ciphertext
    #[serde(default)]
    pub cm_key_id: Option<String>,
    /// `s3://` URI of a PEM CA bundle for HTTPS providers
    #[serde(default)]
    pub certificate_uri: Option<String>,
    /// Listing timeout in seconds for HTTP providers
    #[serde(default)]
    pub http_list_timeout: Option<u64>,
}

/// Result of a streamed transfer into the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedObject {
    pub uri: String,
    pub size: u64,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Files under `path`; hierarchical protocols interpret `path` as a
    /// recursive listing specification
    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>>;

    /// Fetch a whole remote file to `local_path`
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf>;

    /// Stream a remote file into `bucket/key` without buffering it locally
    async fn sync(&self, remote_path: &str, bucket: &str, key: &str) -> Result<SyncedObject>;

    /// Release any open session
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Collaborators shared by every provider client of a run
#[derive(Clone)]
pub struct ProviderContext {
    pub store: Arc<dyn ObjectStore>,
    pub system_bucket: String,
    pub stack: String,
    /// Bound applied to each remote call
    pub timeout: Duration,
    /// Decryption strategies for encrypted credentials, tried in order
    pub decryptors: Vec<Arc<dyn CredentialDecryptor>>,
}

impl ProviderContext {
    pub fn new(store: Arc<dyn ObjectStore>, system_bucket: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            store,
            system_bucket: system_bucket.into(),
            stack: stack.into(),
            timeout: Duration::from_secs(crate::config::DEFAULT_PROVIDER_TIMEOUT_SECS),
            decryptors: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_decryptors(mut self, decryptors: Vec<Arc<dyn CredentialDecryptor>>) -> Self {
        self.decryptors = decryptors;
        self
    }

    /// Key of a file in the stack's crypto folder
    pub fn crypto_key(&self, name: &str) -> String {
        format!("{}/crypto/{}", self.stack, name)
    }

    /// Upload helper shared by the streaming providers
    pub async fn upload(
        &self,
        source: &str,
        bucket: &str,
        key: &str,
        body: BodyStream,
        content_type: &str,
    ) -> Result<SyncedObject> {
        let uri = store_uri(bucket, key);
        info!(%source, %uri, "Syncing remote file");
        let size = self.store.put_stream(bucket, key, body, Some(content_type)).await?;
        Ok(SyncedObject { uri, size })
    }
}

/// Build the client for a provider's protocol
pub fn build_provider_client(
    config: &ProviderConfig,
    ctx: ProviderContext,
) -> Result<Arc<dyn ProviderClient>> {
    debug!(protocol = %config.protocol, host = %config.host, "Building provider client");
    let client: Arc<dyn ProviderClient> = match config.protocol {
        Protocol::Ftp => Arc::new(FtpProviderClient::new(config, ctx)),
        Protocol::Sftp => Arc::new(SftpProviderClient::new(config, ctx)),
        Protocol::Http | Protocol::Https => Arc::new(HttpProviderClient::new(config, ctx)?),
        Protocol::S3 => Arc::new(ObjectStoreProviderClient::new(config, ctx)),
    };
    Ok(client)
}

/// Bound `fut` by `timeout`, reporting expiry as a timed-out remote resource
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GranaryError::RemoteResource(format!(
            "{} timed out after {}s",
            operation,
            timeout.as_secs()
        ))),
    }
}

/// Run a listing, repeating it once if it fails with a timeout
pub async fn retry_list_on_timeout<T, F, Fut>(path: &str, mut list: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match list().await {
            Err(e) if e.is_timeout() && attempt < LIST_TIMEOUT_RETRIES => {
                attempt += 1;
                warn!(%path, attempt, error = %e, "Connection timed out while listing, retrying");
            },
            result => return result,
        }
    }
}

/// Download a small control file and return its contents
pub async fn fetch_text_file(client: &dyn ProviderClient, remote_path: &str) -> Result<String> {
    let bytes = fetch_file(client, remote_path).await?;
    String::from_utf8(bytes).map_err(|e| {
        GranaryError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not UTF-8 text: {}", remote_path, e),
        ))
    })
}

/// Download a small remote file through a temporary directory and return its bytes
pub async fn fetch_file(client: &dyn ProviderClient, remote_path: &str) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let name = remote_path.rsplit('/').next().unwrap_or("download");
    let local = dir.path().join(if name.is_empty() { "download" } else { name });

    let path = client.download(remote_path, &local).await?;
    Ok(tokio::fs::read(path).await?)
}

/// Normalize a listing root: empty and `/` become `None`
pub(crate) fn root_relative(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_provider_config_deserialize() {
        let json = r#"{
            "id": "MODAPS",
            "protocol": "sftp",
            "host": "sftp.example.com",
            "port": 2222,
            "username": "ingest",
            "privateKey": "ingest.pem",
            "cmKeyId": "alias/granary"
        }"#;
        let config: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.protocol, Protocol::Sftp);
        assert_eq!(config.port, Some(2222));
        assert_eq!(config.private_key.as_deref(), Some("ingest.pem"));
        assert!(!config.encrypted);
    }

    #[tokio::test]
    async fn test_retry_list_retries_once_on_timeout() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_list_on_timeout("/data", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GranaryError::RemoteResource("Timed out".into())) }
        })
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_list_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_list_on_timeout("/data", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GranaryError::Transport("FTP Code 550: denied".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_list_recovers_after_timeout() {
        let calls = AtomicU32::new(0);
        let result = retry_list_on_timeout("/data", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(GranaryError::RemoteResource("read timed out".into()))
                } else {
                    Ok(vec!["a.txt"])
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, vec!["a.txt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_timed_out() {
        let err = with_timeout(Duration::from_secs(1), "LIST /data", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_root_relative() {
        assert_eq!(root_relative("/"), None);
        assert_eq!(root_relative(""), None);
        assert_eq!(root_relative("/data/"), Some("/data/".to_string()));
    }
}
