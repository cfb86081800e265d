//! Granary Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Discovery, staging and relocation of granule files from remote providers
//! into a managed object store.
//!
//! # Components
//!
//! - **Providers**: FTP, SFTP, HTTP(S) and object-storage clients behind one
//!   [`provider::ProviderClient`] contract
//! - **Lister**: regex-driven recursive listing for hierarchical providers
//! - **Discovery**: granule grouping and PDR detection
//! - **Transfer**: staging with checksum verification and duplicate handling
//! - **Mover**: destination-driven relocation of staged files
//!
//! # Example
//!
//! ```no_run
//! use granary_ingest::provider::{build_provider_client, ProviderClient, ProviderConfig, ProviderContext};
//! use granary_ingest::store::{ObjectStore, S3ObjectStore, StorageConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&StorageConfig::from_env()).await);
//!     let provider: ProviderConfig = serde_json::from_str(
//!         r#"{"protocol": "ftp", "host": "ftp.example.com"}"#,
//!     )?;
//!
//!     let ctx = ProviderContext::new(store, "prod-internal", "prod");
//!     let client = build_provider_client(&provider, ctx)?;
//!     for file in client.list("/data/(2020|2021)").await? {
//!         println!("{}", file.remote_path());
//!     }
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discover;
pub mod lister;
pub mod mover;
pub mod provider;
pub mod store;
pub mod transfer;

pub use config::IngestConfig;
