//! Managed object store abstraction
//!
//! Everything the engines write goes through [`ObjectStore`]. The S3
//! implementation backs production runs; [`memory::MemoryObjectStore`] backs
//! tests and dry runs.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use granary_common::checksum::{checksums_match, ChecksumHasher};
use granary_common::types::ChecksumAlgorithm;
use granary_common::{GranaryError, Result};
use std::io;
use std::pin::Pin;
use tracing::{debug, instrument};

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Streamed object body
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wrap an in-memory buffer as a single-chunk body
pub fn body_from_bytes(data: Bytes) -> BodyStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl ObjectMeta {
    pub fn uri(&self) -> String {
        store_uri(&self.bucket, &self.key)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object metadata, or `None` when nothing is stored at the key
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// Upload a streamed body, returning the number of bytes written
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: BodyStream,
        content_type: Option<&str>,
    ) -> Result<u64>;

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<BodyStream>;

    /// Server-side copy
    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Every object under `prefix`, in key order
    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.head(bucket, key).await?.is_some())
    }

    async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.put_stream(bucket, key, body_from_bytes(data), content_type)
            .await
            .map(|_| ())
    }

    async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let mut stream = self.get_stream(bucket, key).await?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Copy then delete; a crash between the two leaves a re-runnable duplicate
    async fn move_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()> {
        self.copy(source_bucket, source_key, dest_bucket, dest_key).await?;
        self.delete(source_bucket, source_key).await
    }

    async fn size_of(&self, bucket: &str, key: &str) -> Result<u64> {
        self.head(bucket, key)
            .await?
            .map(|meta| meta.size)
            .ok_or_else(|| GranaryError::FileNotFound(store_uri(bucket, key)))
    }
}

/// Render an object location as `s3://bucket/key`
pub fn store_uri(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Split an `s3://bucket/key` URI into bucket and key
pub fn parse_store_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| GranaryError::InvalidArgument(format!("Not an s3:// URI: {}", uri)))?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        },
        _ => Err(GranaryError::InvalidArgument(format!(
            "URI must name a bucket and a key: {}",
            uri
        ))),
    }
}

/// Join key segments with single slashes, dropping empty segments
pub fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Content type for a key, from its extension
pub fn content_type_for(key: &str) -> mime::Mime {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md5" | "cksum" | "sha1" | "sha256" | "pdr" | "met" => mime::TEXT_PLAIN,
        "xml" => mime::TEXT_XML,
        "json" => mime::APPLICATION_JSON,
        "html" | "htm" => mime::TEXT_HTML,
        "csv" => mime::TEXT_CSV,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "png" => mime::IMAGE_PNG,
        "pdf" => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

/// Stream an object through the hasher for `algorithm`
#[instrument(skip(store))]
pub async fn calculate_object_checksum(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<String> {
    let mut stream = store.get_stream(bucket, key).await?;
    let mut hasher = ChecksumHasher::new(algorithm);
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    let checksum = hasher.finalize();
    debug!(%checksum, "Computed object checksum");
    Ok(checksum)
}

/// Fail with `InvalidChecksum` unless the stored object hashes to `expected`
pub async fn validate_object_checksum(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    algorithm: ChecksumAlgorithm,
    expected: &str,
) -> Result<()> {
    let actual = calculate_object_checksum(store, bucket, key, algorithm).await?;
    if checksums_match(expected, &actual) {
        Ok(())
    } else {
        Err(GranaryError::InvalidChecksum {
            file: store_uri(bucket, key),
            algorithm: algorithm.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_uri() {
        let (bucket, key) = parse_store_uri("s3://stack-internal/file-staging/C___1/a.txt").unwrap();
        assert_eq!(bucket, "stack-internal");
        assert_eq!(key, "file-staging/C___1/a.txt");

        assert!(parse_store_uri("https://example.com/a").is_err());
        assert!(parse_store_uri("s3://bucket-only").is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key(["file-staging/", "/C___1", "a.txt"]), "file-staging/C___1/a.txt");
        assert_eq!(join_key(["", "a.txt"]), "a.txt");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("granule.cmr.xml"), mime::TEXT_XML);
        assert_eq!(content_type_for("G.TXT").essence_str(), "text/plain");
        assert_eq!(content_type_for("data.hdf"), mime::APPLICATION_OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_validate_object_checksum() {
        let store = MemoryObjectStore::new();
        store
            .put_bytes("bucket", "a.txt", Bytes::from_static(b"hello world"), None)
            .await
            .unwrap();

        validate_object_checksum(&store, "bucket", "a.txt", ChecksumAlgorithm::Md5, "5eb63bbbe01eeed093cb22bb8f5acdc3")
            .await
            .unwrap();

        let err = validate_object_checksum(&store, "bucket", "a.txt", ChecksumAlgorithm::Md5, "0000")
            .await
            .unwrap_err();
        assert!(matches!(err, GranaryError::InvalidChecksum { .. }));
    }
}
