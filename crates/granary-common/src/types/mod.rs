//! Common types used across Granary
//!
//! These mirror the JSON documents exchanged with the collections store and
//! the workflow orchestrator, so every struct serializes with camelCase keys.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{GranaryError, Result};

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumAlgorithm {
    /// POSIX `cksum` CRC
    Cksum,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Side-car suffixes recognized during the checksum pre-pass
    pub const SIDECAR_EXTENSIONS: [&'static str; 4] = [".md5", ".cksum", ".sha1", ".sha256"];

    /// Infer the algorithm from a side-car file name such as `G.txt.md5`
    pub fn from_sidecar_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChecksumAlgorithm::Cksum => "cksum",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = GranaryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "cksum" => Ok(ChecksumAlgorithm::Cksum),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(GranaryError::InvalidArgument(format!(
                "Unsupported checksum algorithm: {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ChecksumAlgorithm {
    type Error = GranaryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChecksumAlgorithm> for String {
    fn from(value: ChecksumAlgorithm) -> Self {
        value.to_string()
    }
}

/// Canonical entry kind shared by every protocol's directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Normalize protocol-native type flags: `-`/`0` are files, `d`/`1` directories
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "-" | "0" | "f" | "file" => Some(EntryKind::File),
            "d" | "1" | "dir" | "directory" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// One entry of a single-level directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub time: Option<DateTime<Utc>>,
}

impl ListEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            time: None,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            time: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A remote file found by a provider listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    /// Directory holding the file relative to the listing root; `None` at the root
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl FileDescriptor {
    /// Build a descriptor, normalizing an empty path to `None`
    pub fn new(name: impl Into<String>, path: Option<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.filter(|p| !p.is_empty()),
            size,
            time: None,
        }
    }

    /// Full remote path of the file
    pub fn remote_path(&self) -> String {
        join_remote_path(self.path.as_deref(), &self.name)
    }
}

/// Join a directory and a file name without doubling separators
pub fn join_remote_path(dir: Option<&str>, name: &str) -> String {
    match dir {
        None | Some("") => name.to_string(),
        Some(dir) if dir.ends_with('/') => format!("{}{}", dir, name),
        Some(dir) => format!("{}/{}", dir, name),
    }
}

/// Duplicate handling policy for staged files and discovered granules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateHandling {
    #[default]
    Error,
    Skip,
    Replace,
    Version,
}

impl std::fmt::Display for DuplicateHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DuplicateHandling::Error => "error",
            DuplicateHandling::Skip => "skip",
            DuplicateHandling::Replace => "replace",
            DuplicateHandling::Version => "version",
        };
        f.write_str(name)
    }
}

/// File-type rule of a collection; the first matching rule wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFileConfig {
    pub regex: String,
    /// Bucket role, resolved through [`BucketsConfig`]
    pub bucket: String,
    #[serde(default, alias = "url_path", skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub name: String,
    pub version: String,
    pub granule_id_extraction: String,
    #[serde(default)]
    pub files: Vec<CollectionFileConfig>,
    #[serde(default, alias = "url_path", skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, alias = "provider_path", skip_serializing_if = "Option::is_none")]
    pub provider_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_handling: Option<DuplicateHandling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_files_config_for_discovery: Option<bool>,
}

impl Collection {
    pub fn collection_id(&self) -> String {
        collection_id(&self.name, &self.version)
    }

    pub fn granule_id_regex(&self) -> Result<Regex> {
        compile_regex(&self.granule_id_extraction)
    }

    /// First file config whose regex matches `file_name`
    pub fn file_config_for(&self, file_name: &str) -> Result<Option<&CollectionFileConfig>> {
        for config in &self.files {
            if compile_regex(&config.regex)?.is_match(file_name) {
                return Ok(Some(config));
            }
        }
        Ok(None)
    }
}

/// Identifier of a collection: `name___version`
pub fn collection_id(name: &str, version: &str) -> String {
    format!("{}___{}", name, version)
}

pub fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| GranaryError::InvalidArgument(format!("Invalid regex '{}': {}", pattern, e)))
}

/// One file of a granule, before or after staging
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GranuleFile {
    pub name: String,
    /// Remote directory on the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, alias = "filepath", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_type: Option<ChecksumAlgorithm>,
    #[serde(default, alias = "checksumValue", skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, alias = "url_path", skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_staging_dir: Option<String>,
    /// `s3://` URI of the staged object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_found: Option<bool>,
}

impl GranuleFile {
    pub fn from_descriptor(file: &FileDescriptor) -> Self {
        Self {
            name: file.name.clone(),
            path: file.path.clone(),
            size: Some(file.size),
            time: file.time,
            ..Default::default()
        }
    }

    pub fn remote_path(&self) -> String {
        join_remote_path(self.path.as_deref(), &self.name)
    }

    /// Descriptive-metadata documents travel with the data files
    pub fn is_metadata_file(&self) -> bool {
        self.name.ends_with(".cmr.xml") || self.name.ends_with(".cmr.json")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Granule {
    pub granule_id: String,
    pub data_type: String,
    pub version: String,
    #[serde(default)]
    pub files: Vec<GranuleFile>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub published: bool,
}

/// Move destination; the first regex match wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub regex: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub bucket_type: Option<String>,
}

/// Bucket role (`private`, `protected`, `public`, ...) to bucket mapping
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketsConfig(pub HashMap<String, BucketConfig>);

impl BucketsConfig {
    pub fn bucket_name(&self, role: &str) -> Option<&str> {
        self.0.get(role).map(|b| b.name.as_str())
    }

    pub fn bucket_type(&self, role: &str) -> Option<&str> {
        self.0.get(role).and_then(|b| b.bucket_type.as_deref())
    }

    /// Bucket name for `role`, failing when the role is not configured
    pub fn resolve(&self, role: &str) -> Result<&str> {
        self.bucket_name(role).ok_or_else(|| {
            GranaryError::InvalidArgument(format!("No bucket configured for role '{}'", role))
        })
    }
}
