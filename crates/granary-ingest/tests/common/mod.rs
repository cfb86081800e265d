//! Shared fixtures for the engine integration tests
//!
//! [`ScriptedProvider`] serves files from an in-memory directory tree and
//! writes synced files into a [`MemoryObjectStore`], so the discovery,
//! transfer and move engines can run end to end without a network.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use granary_common::types::{
    BucketConfig, BucketsConfig, Collection, CollectionFileConfig, FileDescriptor, Granule,
    GranuleFile,
};
use granary_common::{GranaryError, Result};
use granary_ingest::provider::{Protocol, ProviderClient, SyncedObject};
use granary_ingest::store::{store_uri, MemoryObjectStore, ObjectStore};
use granary_ingest::transfer::{GranuleTransfer, TransferOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const STAGING_BUCKET: &str = "test-internal";

pub struct ScriptedProvider {
    store: Arc<MemoryObjectStore>,
    files: Mutex<BTreeMap<String, Bytes>>,
    pub syncs: AtomicUsize,
    pub closes: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(store: Arc<MemoryObjectStore>) -> Self {
        Self {
            store,
            files: Mutex::new(BTreeMap::new()),
            syncs: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    /// Add or replace the file at `path`
    pub fn put(&self, path: &str, data: &'static str) {
        self.files.lock().unwrap().insert(path.trim_start_matches('/').to_string(), Bytes::from_static(data.as_bytes()));
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| GranaryError::FileNotFound(format!("{} was not found on the provider", path)))
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
        let dir = path.trim_matches('/');
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(full, data)| {
                let (parent, name) = full.rsplit_once('/').unwrap_or(("", full.as_str()));
                (parent == dir).then(|| FileDescriptor::new(name, Some(parent.to_string()), data.len() as u64))
            })
            .collect())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
        tokio::fs::write(local_path, self.get(remote_path)?).await?;
        Ok(local_path.to_path_buf())
    }

    async fn sync(&self, remote_path: &str, bucket: &str, key: &str) -> Result<SyncedObject> {
        let data = self.get(remote_path)?;
        // Give sibling transfers a chance to interleave.
        tokio::task::yield_now().await;
        let size = data.len() as u64;
        self.store.put_bytes(bucket, key, data, None).await?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(SyncedObject { uri: store_uri(bucket, key), size })
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collection `C___1` whose `.txt` files go to the `private` role
pub fn collection() -> Collection {
    Collection {
        name: "C".into(),
        version: "1".into(),
        granule_id_extraction: r"^(G\d*)\.txt".into(),
        files: vec![CollectionFileConfig {
            regex: r"^G\d*\.txt$".into(),
            bucket: "private".into(),
            url_path: None,
            file_type: Some("data".into()),
            sample_file_name: Some("G.txt".into()),
        }],
        url_path: None,
        provider_path: Some("src".into()),
        duplicate_handling: None,
        ignore_files_config_for_discovery: None,
    }
}

pub fn buckets() -> BucketsConfig {
    BucketsConfig(HashMap::from([(
        "private".to_string(),
        BucketConfig { name: STAGING_BUCKET.into(), bucket_type: Some("private".into()) },
    )]))
}

pub fn granule(name: &str) -> Granule {
    Granule {
        granule_id: "G".into(),
        data_type: "C".into(),
        version: "1".into(),
        files: vec![GranuleFile { name: name.into(), path: Some("src".into()), ..Default::default() }],
        published: false,
    }
}

pub fn transfer(
    store: Arc<MemoryObjectStore>,
    provider: Arc<ScriptedProvider>,
    options: TransferOptions,
) -> GranuleTransfer {
    let store: Arc<dyn ObjectStore> = store;
    GranuleTransfer::new(store, provider, collection(), buckets(), options)
}
