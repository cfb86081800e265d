use async_trait::async_trait;
use aws_sdk_s3::{
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use granary_common::{GranaryError, Result};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::{store_uri, BodyStream, ObjectMeta, ObjectStore, StorageConfig};

/// Size of each multipart upload part; bounds memory per streamed upload
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Largest object a single CopyObject request accepts
pub const MAX_SINGLE_COPY_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Part size used when a copy has to go through UploadPartCopy
pub const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!(endpoint = ?config.endpoint, region = %config.region, "Initializing S3 object store");

        let sdk_config = config.sdk_config().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<MultipartUpload> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| sdk_error("CreateMultipartUpload", bucket, key, e))?;

        let upload_id = response.upload_id().ok_or_else(|| {
            GranaryError::Transport(format!(
                "CreateMultipartUpload returned no upload id for {}",
                store_uri(bucket, key)
            ))
        })?;

        Ok(MultipartUpload {
            upload_id: upload_id.to_string(),
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload: &mut MultipartUpload,
        data: Bytes,
    ) -> Result<()> {
        let part_number = upload.parts.len() as i32 + 1;
        debug!(part_number, size = data.len(), "Uploading part");

        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("UploadPart", bucket, key, e))?;

        if response.e_tag().is_none() {
            warn!(part_number, "upload_part returned no e_tag");
        }

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(response.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload: MultipartUpload,
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(upload.parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_error("CompleteMultipartUpload", bucket, key, e))?;
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(uri = %store_uri(bucket, key), error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }

    /// Drain `body` into S3, switching to multipart once one full part is buffered
    async fn stream_parts(
        &self,
        bucket: &str,
        key: &str,
        mut body: BodyStream,
        content_type: Option<&str>,
        multipart: &mut Option<MultipartUpload>,
    ) -> Result<u64> {
        let mut buffer = BytesMut::with_capacity(PART_SIZE);
        let mut total = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= PART_SIZE {
                if multipart.is_none() {
                    *multipart = Some(self.create_multipart(bucket, key, content_type).await?);
                }
                let part = buffer.split_to(PART_SIZE).freeze();
                if let Some(upload) = multipart.as_mut() {
                    self.upload_part(bucket, key, upload, part).await?;
                }
            }
        }

        match multipart.take() {
            None => {
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .set_content_type(content_type.map(str::to_string))
                    .body(ByteStream::from(buffer.freeze()))
                    .send()
                    .await
                    .map_err(|e| sdk_error("PutObject", bucket, key, e))?;
            },
            Some(mut upload) => {
                if !buffer.is_empty() {
                    let result = self.upload_part(bucket, key, &mut upload, buffer.freeze()).await;
                    if let Err(e) = result {
                        *multipart = Some(upload);
                        return Err(e);
                    }
                }
                let upload_id = upload.upload_id.clone();
                if let Err(e) = self.complete_multipart(bucket, key, upload).await {
                    self.abort_multipart(bucket, key, &upload_id).await;
                    return Err(e);
                }
            },
        }

        Ok(total)
    }

    async fn copy_multipart(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
        size: u64,
    ) -> Result<()> {
        let mut upload = self.create_multipart(dest_bucket, dest_key, None).await?;
        let copy_source = copy_source(source_bucket, source_key);

        let mut start = 0u64;
        while start < size {
            let end = (start + COPY_PART_SIZE).min(size) - 1;
            let part_number = upload.parts.len() as i32 + 1;

            let response = self
                .client
                .upload_part_copy()
                .bucket(dest_bucket)
                .key(dest_key)
                .upload_id(&upload.upload_id)
                .part_number(part_number)
                .copy_source(&copy_source)
                .copy_source_range(format!("bytes={}-{}", start, end))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.abort_multipart(dest_bucket, dest_key, &upload.upload_id).await;
                    return Err(sdk_error("UploadPartCopy", dest_bucket, dest_key, e));
                },
            };

            upload.parts.push(
                CompletedPart::builder()
                    .set_e_tag(
                        response
                            .copy_part_result()
                            .and_then(|r| r.e_tag())
                            .map(str::to_string),
                    )
                    .part_number(part_number)
                    .build(),
            );
            start = end + 1;
        }

        let upload_id = upload.upload_id.clone();
        if let Err(e) = self.complete_multipart(dest_bucket, dest_key, upload).await {
            self.abort_multipart(dest_bucket, dest_key, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => Ok(Some(ObjectMeta {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: response.content_length().unwrap_or(0).max(0) as u64,
                last_modified: response
                    .last_modified()
                    .and_then(to_chrono)
                    .unwrap_or_else(Utc::now),
            })),
            Err(e) => {
                if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(sdk_error("HeadObject", bucket, key, e))
                }
            },
        }
    }

    #[instrument(skip(self, body))]
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: BodyStream,
        content_type: Option<&str>,
    ) -> Result<u64> {
        let mut multipart = None;
        match self
            .stream_parts(bucket, key, body, content_type, &mut multipart)
            .await
        {
            Ok(size) => {
                info!(uri = %store_uri(bucket, key), size, "Uploaded object");
                Ok(size)
            },
            Err(e) => {
                if let Some(upload) = multipart {
                    self.abort_multipart(bucket, key, &upload.upload_id).await;
                }
                Err(e)
            },
        }
    }

    #[instrument(skip(self))]
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<BodyStream> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                    GranaryError::FileNotFound(store_uri(bucket, key))
                } else {
                    sdk_error("GetObject", bucket, key, e)
                }
            })?;

        Ok(Box::pin(ReaderStream::new(response.body.into_async_read())))
    }

    #[instrument(skip(self))]
    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest_bucket: &str,
        dest_key: &str,
    ) -> Result<()> {
        let size = self.size_of(source_bucket, source_key).await?;

        if size > MAX_SINGLE_COPY_SIZE {
            self.copy_multipart(source_bucket, source_key, dest_bucket, dest_key, size)
                .await?;
        } else {
            self.client
                .copy_object()
                .copy_source(copy_source(source_bucket, source_key))
                .bucket(dest_bucket)
                .key(dest_key)
                .send()
                .await
                .map_err(|e| sdk_error("CopyObject", dest_bucket, dest_key, e))?;
        }

        info!(
            source = %store_uri(source_bucket, source_key),
            target = %store_uri(dest_bucket, dest_key),
            size,
            "Copied object"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteObject", bucket, key, e))?;

        debug!(uri = %store_uri(bucket, key), "Deleted object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| sdk_error("ListObjectsV2", bucket, prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectMeta {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: object
                            .last_modified()
                            .and_then(to_chrono)
                            .unwrap_or_else(Utc::now),
                    });
                }
            }

            match (response.is_truncated(), response.next_continuation_token()) {
                (Some(true), Some(token)) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(bucket, prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// `bucket/key` with the key percent-encoded as CopyObject expects
fn copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            },
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    format!("{}/{}", bucket, encoded)
}

/// Normalize an SDK failure; dispatch failures and timeouts are remote-resource errors
fn sdk_error<E, R>(operation: &str, bucket: &str, key: &str, err: SdkError<E, R>) -> GranaryError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!(
        "{} {} failed: {}",
        operation,
        store_uri(bucket, key),
        DisplayErrorContext(&err)
    );
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            GranaryError::RemoteResource(message)
        },
        _ => GranaryError::Transport(message),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encoding() {
        assert_eq!(copy_source("bucket", "dir/a.txt"), "bucket/dir/a.txt");
        assert_eq!(copy_source("bucket", "dir/a b+c.txt"), "bucket/dir/a%20b%2Bc.txt");
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_chrono(&dt).unwrap().timestamp(), 1_700_000_000);
    }
}
