//! Object-storage provider client
//!
//! The provider's host names the source bucket. Listing is natively recursive
//! over the key prefix and sync is a server-side copy, so no bytes pass
//! through this process.

use async_trait::async_trait;
use futures::StreamExt;
use granary_common::types::FileDescriptor;
use granary_common::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

use super::{root_relative, Protocol, ProviderClient, ProviderConfig, ProviderContext, SyncedObject};
use crate::store::store_uri;

pub struct ObjectStoreProviderClient {
    bucket: String,
    ctx: ProviderContext,
}

impl ObjectStoreProviderClient {
    pub fn new(config: &ProviderConfig, ctx: ProviderContext) -> Self {
        Self {
            bucket: config.host.clone(),
            ctx,
        }
    }

    fn key_for(remote_path: &str) -> &str {
        remote_path.trim_start_matches('/')
    }
}

#[async_trait]
impl ProviderClient for ObjectStoreProviderClient {
    fn protocol(&self) -> Protocol {
        Protocol::S3
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let prefix = root_relative(path)
            .map(|p| p.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let objects = self.ctx.store.list_prefix(&self.bucket, &prefix).await?;
        let files: Vec<FileDescriptor> = objects
            .into_iter()
            // Folder placeholder objects.
            .filter(|object| !object.key.ends_with('/'))
            .map(|object| {
                let (dir, name) = match object.key.rsplit_once('/') {
                    Some((dir, name)) => (Some(dir.to_string()), name.to_string()),
                    None => (None, object.key.clone()),
                };
                FileDescriptor {
                    name,
                    path: dir,
                    size: object.size,
                    time: Some(object.last_modified),
                }
            })
            .collect();

        info!(count = files.len(), "Objects found on provider bucket");
        Ok(files)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
        let key = Self::key_for(remote_path);
        info!(uri = %store_uri(&self.bucket, key), local = %local_path.display(), "Downloading");

        let mut body = self.ctx.store.get_stream(&self.bucket, key).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(local_path.to_path_buf())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn sync(&self, remote_path: &str, bucket: &str, key: &str) -> Result<SyncedObject> {
        let source_key = Self::key_for(remote_path);
        info!(
            source = %store_uri(&self.bucket, source_key),
            destination = %store_uri(bucket, key),
            "Copying object"
        );

        self.ctx.store.copy(&self.bucket, source_key, bucket, key).await?;
        let size = self.ctx.store.size_of(bucket, key).await?;
        Ok(SyncedObject {
            uri: store_uri(bucket, key),
            size,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{MemoryObjectStore, ObjectStore};
    use granary_common::GranaryError;
    use std::sync::Arc;

    fn client(store: Arc<MemoryObjectStore>) -> ObjectStoreProviderClient {
        let config = ProviderConfig {
            id: None,
            protocol: Protocol::S3,
            host: "provider-bucket".into(),
            port: None,
            username: None,
            password: None,
            encrypted: false,
            private_key: None,
            cm_key_id: None,
            certificate_uri: None,
            http_list_timeout: None,
        };
        ObjectStoreProviderClient::new(&config, ProviderContext::new(store, "system", "stack"))
    }

    #[tokio::test]
    async fn test_list_is_recursive_and_skips_folders() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("provider-bucket", "data/", "").await;
        store.insert("provider-bucket", "data/a.hdf", "aaa").await;
        store.insert("provider-bucket", "data/2020/b.hdf", "b").await;
        store.insert("provider-bucket", "other/c.hdf", "c").await;

        let files = client(store.clone()).list("data").await.unwrap();
        let found: Vec<_> = files.iter().map(|f| (f.path.as_deref(), f.name.as_str(), f.size)).collect();
        assert_eq!(found, vec![(Some("data/2020"), "b.hdf", 1), (Some("data"), "a.hdf", 3)]);
    }

    #[tokio::test]
    async fn test_list_root() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("provider-bucket", "top.txt", "x").await;
        let files = client(store).list("/").await.unwrap();
        assert_eq!(files[0].name, "top.txt");
        assert_eq!(files[0].path, None);
    }

    #[tokio::test]
    async fn test_sync_copies_server_side() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("provider-bucket", "data/a.hdf", "payload").await;

        let synced = client(store.clone()).sync("data/a.hdf", "private", "staging/a.hdf").await.unwrap();
        assert_eq!(synced.size, 7);
        assert_eq!(store.get_bytes("private", "staging/a.hdf").await.unwrap().as_ref(), b"payload");
        assert!(store.exists("provider-bucket", "data/a.hdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_missing_source() {
        let store = Arc::new(MemoryObjectStore::new());
        let err = client(store).sync("nope.hdf", "private", "nope.hdf").await.unwrap_err();
        assert!(matches!(err, GranaryError::FileNotFound(_)));
    }
}
