//! In-process object store

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use granary_common::{GranaryError, Result};
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{body_from_bytes, store_uri, BodyStream, ObjectMeta, ObjectStore};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    content_type: Option<String>,
}

/// Thread-safe object store kept entirely in memory
///
/// Objects are ordered by `(bucket, key)` so prefix listings come back in
/// the same lexicographic order S3 uses.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object with an explicit modification time
    pub async fn insert_at(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                last_modified,
                content_type: None,
            },
        );
    }

    pub async fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.insert_at(bucket, key, data, Utc::now()).await;
    }

    /// Every key stored in `bucket`
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub async fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.content_type.clone())
    }

    fn meta(bucket: &str, key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: object.data.len() as u64,
            last_modified: object.last_modified,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| Self::meta(bucket, key, object)))
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: BodyStream,
        content_type: Option<&str>,
    ) -> Result<u64> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let size = buffer.len() as u64;

        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: buffer.freeze(),
                last_modified: Utc::now(),
                content_type: content_type.map(str::to_string),
            },
        );
        debug!(uri = %store_uri(bucket, key), size, "Stored object in memory");
        Ok(size)
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<BodyStream> {
        let data = self
            .objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| GranaryError::FileNotFound(store_uri(bucket, key)))?;
        Ok(body_from_bytes(data))
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()> {
        let mut objects = self.objects.write().await;
        let mut object = objects
            .get(&(source_bucket.to_string(), source_key.to_string()))
            .cloned()
            .ok_or_else(|| GranaryError::FileNotFound(store_uri(source_bucket, source_key)))?;
        object.last_modified = Utc::now();
        objects.insert((dest_bucket.to_string(), dest_key.to_string()), object);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        // Deleting a missing key succeeds, as it does on S3.
        self.objects
            .write()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((b, k), object)| Self::meta(b, k, object))
            .collect())
    }
}
