//! Granary Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Granary ingest tools.
//!
//! # Overview
//!
//! - **Error Handling**: the crate-wide [`GranaryError`] and [`Result`] alias
//! - **Checksums**: incremental hashing for cksum, MD5, SHA-1 and SHA-2 digests
//! - **Types**: collections, granules, file descriptors and destinations
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use granary_common::checksum::compute_file_checksum;
//! use granary_common::types::ChecksumAlgorithm;
//! use granary_common::Result;
//!
//! fn digest(path: &str) -> Result<()> {
//!     let checksum = compute_file_checksum(path, ChecksumAlgorithm::Md5)?;
//!     println!("md5 {}", checksum);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{GranaryError, Result};
