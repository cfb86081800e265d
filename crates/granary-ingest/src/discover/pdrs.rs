//! PDR discovery and staging
//!
//! A PDR is parsed before it is staged, so a malformed delivery record never
//! lands in the PDR folder and is offered again on the next discovery run.

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use granary_common::types::FileDescriptor;
use granary_common::{GranaryError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{IngestConfig, DEFAULT_CONCURRENCY, DEFAULT_PDRS_FOLDER};
use crate::discover::pdr_parser::{parse_pdr, ParsedPdr};
use crate::provider::{fetch_file, ProviderClient};
use crate::store::{content_type_for, join_key, store_uri, ObjectStore};

pub fn is_pdr(name: &str) -> bool {
    name.to_ascii_uppercase().ends_with(".PDR")
}

/// Key of a staged PDR: `<stack>/<pdrsFolder>/<name>`
pub fn pdr_key(stack: &str, pdrs_folder: &str, name: &str) -> String {
    join_key([stack, pdrs_folder, name])
}

/// Where PDRs are tracked and how discovery treats ones already staged
#[derive(Debug, Clone)]
pub struct PdrDiscovery {
    pub stack: String,
    pub bucket: String,
    pub pdrs_folder: String,
    /// Return every PDR, even ones already staged
    pub force: bool,
    pub concurrency: usize,
}

impl PdrDiscovery {
    pub fn new(stack: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            bucket: bucket.into(),
            pdrs_folder: DEFAULT_PDRS_FOLDER.to_string(),
            force: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            stack: config.stack.clone(),
            bucket: config.system_bucket.clone(),
            pdrs_folder: config.pdrs_folder.clone(),
            force: false,
            concurrency: config.concurrency,
        }
    }

    pub fn key_for(&self, name: &str) -> String {
        pdr_key(&self.stack, &self.pdrs_folder, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedPdr {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub bucket: String,
    pub key: String,
    pub size: u64,
    #[serde(flatten)]
    pub contents: ParsedPdr,
}

/// PDRs under `path` that have not been staged yet
///
/// Each candidate gets its own existence check; the checks run in parallel.
/// The client is closed whether or not discovery succeeds.
#[instrument(skip(client, store, options), fields(bucket = %options.bucket))]
pub async fn discover_pdrs(
    client: &dyn ProviderClient,
    store: Arc<dyn ObjectStore>,
    options: &PdrDiscovery,
    path: &str,
) -> Result<Vec<FileDescriptor>> {
    let result = discover(client, store.as_ref(), options, path).await;
    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close provider session");
    }
    result
}

async fn discover(
    client: &dyn ProviderClient,
    store: &dyn ObjectStore,
    options: &PdrDiscovery,
    path: &str,
) -> Result<Vec<FileDescriptor>> {
    let pdrs: Vec<FileDescriptor> = client
        .list(path)
        .await?
        .into_iter()
        .filter(|file| is_pdr(&file.name))
        .collect();
    info!(%path, pdrs = pdrs.len(), "Found PDRs on provider");

    if options.force {
        return Ok(pdrs);
    }

    let checked: Vec<(FileDescriptor, bool)> = stream::iter(pdrs)
        .map(|pdr| async move {
            let exists = store.exists(&options.bucket, &options.key_for(&pdr.name)).await?;
            Ok::<_, GranaryError>((pdr, exists))
        })
        .buffered(options.concurrency.max(1))
        .try_collect()
        .await?;

    Ok(checked
        .into_iter()
        .filter_map(|(pdr, exists)| {
            if exists {
                debug!(pdr = %pdr.name, "PDR already staged, skipping");
                None
            } else {
                Some(pdr)
            }
        })
        .collect())
}

/// Download a discovered PDR, parse it, and store it under the stack's PDR folder
///
/// Nothing is stored unless the PDR parses.
#[instrument(skip_all, fields(pdr = %pdr.name))]
pub async fn stage_pdr(
    client: &dyn ProviderClient,
    store: &dyn ObjectStore,
    options: &PdrDiscovery,
    pdr: &FileDescriptor,
) -> Result<StagedPdr> {
    let bytes = fetch_file(client, &pdr.remote_path()).await?;
    let text = std::str::from_utf8(&bytes).map_err(|e| GranaryError::PdrParse {
        pdr: pdr.name.clone(),
        reason: format!("not UTF-8 text: {}", e),
    })?;
    let contents = parse_pdr(&pdr.name, text)?;
    info!(granules = contents.granules_count, files = contents.files_count, "Parsed PDR");

    let key = options.key_for(&pdr.name);
    let size = bytes.len() as u64;
    store
        .put_bytes(
            &options.bucket,
            &key,
            Bytes::from(bytes),
            Some(content_type_for(&pdr.name).essence_str()),
        )
        .await?;
    info!(uri = %store_uri(&options.bucket, &key), "Staged PDR");

    Ok(StagedPdr {
        name: pdr.name.clone(),
        path: pdr.path.clone(),
        bucket: options.bucket.clone(),
        key,
        size,
        contents,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::provider::{Protocol, SyncedObject};
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct PdrProvider;

    #[async_trait]
    impl ProviderClient for PdrProvider {
        fn protocol(&self) -> Protocol {
            Protocol::Sftp
        }

        async fn list(&self, _path: &str) -> Result<Vec<FileDescriptor>> {
            Ok(vec![
                FileDescriptor::new("A.PDR", Some("pdrs".into()), 4),
                FileDescriptor::new("b.pdr", Some("pdrs".into()), 4),
                FileDescriptor::new("c.txt", Some("pdrs".into()), 4),
            ])
        }

        async fn download(&self, remote_path: &str, local_path: &Path) -> Result<PathBuf> {
            let body: &[u8] = match remote_path {
                "pdrs/latin1.PDR" => b"ORIGINATING_SYSTEM = \xC9DOS;",
                "pdrs/broken.PDR" => b"OBJECT = FILE_GROUP;",
                _ => include_bytes!("../../tests/fixtures/MOD09GQ.PDR"),
            };
            tokio::fs::write(local_path, body).await?;
            Ok(local_path.to_path_buf())
        }

        async fn sync(&self, remote_path: &str, _bucket: &str, _key: &str) -> Result<SyncedObject> {
            Err(GranaryError::FileNotFound(remote_path.into()))
        }
    }

    #[test]
    fn test_is_pdr() {
        assert!(is_pdr("x.PDR"));
        assert!(is_pdr("x.pdr"));
        assert!(!is_pdr("x.PDR.md5"));
    }

    #[test]
    fn test_pdr_key() {
        assert_eq!(pdr_key("prod", "pdrs/", "A.PDR"), "prod/pdrs/A.PDR");
    }

    #[tokio::test]
    async fn test_discover_filters_staged_pdrs() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("internal", "prod/pdrs/A.PDR", "x").await;
        let options = PdrDiscovery::new("prod", "internal");

        let pdrs = discover_pdrs(&PdrProvider, store.clone(), &options, "pdrs").await.unwrap();
        let names: Vec<&str> = pdrs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b.pdr"]);

        let forced = PdrDiscovery { force: true, ..options };
        let pdrs = discover_pdrs(&PdrProvider, store, &forced, "pdrs").await.unwrap();
        assert_eq!(pdrs.len(), 2);
    }

    #[tokio::test]
    async fn test_stage_pdr() {
        let store = MemoryObjectStore::new();
        let options = PdrDiscovery::new("prod", "internal");
        let pdr = FileDescriptor::new("A.PDR", Some("pdrs".into()), 20);

        let staged = stage_pdr(&PdrProvider, &store, &options, &pdr).await.unwrap();
        assert_eq!(staged.key, "prod/pdrs/A.PDR");
        assert_eq!(staged.size, include_bytes!("../../tests/fixtures/MOD09GQ.PDR").len() as u64);
        assert_eq!(staged.contents.granules_count, 1);
        assert_eq!(staged.contents.granules[0].data_type, "MOD09GQ");
        assert_eq!(store.content_type("internal", "prod/pdrs/A.PDR").await.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_unparseable_pdr_is_not_staged() {
        let store = MemoryObjectStore::new();
        let options = PdrDiscovery::new("prod", "internal");
        let pdr = FileDescriptor::new("broken.PDR", Some("pdrs".into()), 20);

        let err = stage_pdr(&PdrProvider, &store, &options, &pdr).await.unwrap_err();
        assert!(matches!(err, GranaryError::PdrParse { ref pdr, .. } if pdr == "broken.PDR"));
        assert!(!store.exists("internal", "prod/pdrs/broken.PDR").await.unwrap());
    }

    #[tokio::test]
    async fn test_non_utf8_pdr_error_names_the_pdr() {
        let store = MemoryObjectStore::new();
        let options = PdrDiscovery::new("prod", "internal");
        let pdr = FileDescriptor::new("latin1.PDR", Some("pdrs".into()), 30);

        let err = stage_pdr(&PdrProvider, &store, &options, &pdr).await.unwrap_err();
        match &err {
            GranaryError::PdrParse { pdr, reason } => {
                assert_eq!(pdr, "latin1.PDR");
                assert!(reason.starts_with("not UTF-8 text"));
            },
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("latin1.PDR"));
        assert_eq!(err.kind(), "PDRParsingError");
        assert!(!store.exists("internal", "prod/pdrs/latin1.PDR").await.unwrap());
    }
}
