use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::Credentials;
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings shared by the S3 object store and the KMS decryptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl StorageConfig {
    /// Read `S3_*` variables, falling back to the standard `AWS_*` ones
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION")
                .or_else(|_| env::var("AWS_REGION"))
                .unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    /// Local MinIO with its stock credentials
    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    /// Build the shared SDK configuration
    ///
    /// Static keys are used when both are configured; otherwise the default
    /// provider chain (environment, profile, instance role) applies.
    pub async fn sdk_config(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        if let (Some(access), Some(secret)) = (&self.access_key, &self.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access.as_str(),
                secret.as_str(),
                None,
                None,
                "granary-storage",
            ));
        }

        if let Some(endpoint) = &self.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        loader.load().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.path_style);
        assert_eq!(config.access_key.as_deref(), Some("minioadmin"));
    }

    #[test]
    fn test_default_region() {
        let config = StorageConfig::default();
        assert_eq!(config.region, "us-east-1");
        assert!(config.endpoint.is_none());
    }
}
