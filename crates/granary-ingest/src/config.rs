//! Configuration management

use granary_common::{GranaryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::StorageConfig;

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Default prefix under which staged files are written.
pub const DEFAULT_FILE_STAGING_DIR: &str = "file-staging";

/// Default folder, under the stack prefix, holding staged PDRs.
pub const DEFAULT_PDRS_FOLDER: &str = "pdrs";

/// Default number of concurrent per-file operations.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default bound on a single provider operation, in seconds.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Ingest engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Deployment name; prefixes crypto keys and staged PDRs
    pub stack: String,
    /// Bucket holding stack-internal objects
    pub system_bucket: String,
    pub file_staging_dir: String,
    pub pdrs_folder: String,
    pub concurrency: usize,
    pub provider_timeout_secs: u64,
    #[serde(skip)]
    pub storage: StorageConfig,
}

impl IngestConfig {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let stack = lookup("GRANARY_STACK")
            .ok_or_else(|| GranaryError::Config("GRANARY_STACK must be set".into()))?;
        let system_bucket = lookup("GRANARY_SYSTEM_BUCKET")
            .ok_or_else(|| GranaryError::Config("GRANARY_SYSTEM_BUCKET must be set".into()))?;

        Ok(Self {
            stack,
            system_bucket,
            file_staging_dir: lookup("GRANARY_FILE_STAGING_DIR")
                .unwrap_or_else(|| DEFAULT_FILE_STAGING_DIR.to_string()),
            pdrs_folder: lookup("GRANARY_PDRS_FOLDER").unwrap_or_else(|| DEFAULT_PDRS_FOLDER.to_string()),
            concurrency: parse_var(&lookup, "GRANARY_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
            provider_timeout_secs: parse_var(&lookup, "GRANARY_PROVIDER_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS),
            storage: StorageConfig::from_env(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.stack.trim().is_empty() {
            return Err(GranaryError::Config("Stack name cannot be empty".into()));
        }

        if self.system_bucket.trim().is_empty() {
            return Err(GranaryError::Config("System bucket cannot be empty".into()));
        }

        if self.concurrency == 0 {
            return Err(GranaryError::Config("Concurrency must be greater than 0".into()));
        }

        if self.provider_timeout_secs == 0 {
            return Err(GranaryError::Config("Provider timeout must be greater than 0".into()));
        }

        if self.file_staging_dir.trim_matches('/').is_empty() {
            tracing::warn!("Empty file staging dir - files will be staged at the bucket root");
        }

        Ok(())
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GranaryError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}
