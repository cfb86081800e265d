//! Granule discovery
//!
//! Files are grouped by the first capture group of the collection's
//! `granuleIdExtraction` regex, then classified against the collection's file
//! configs. Grouping happens first so a granule whose files all fail
//! classification under a strict collection is still emitted, just empty.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use granary_common::types::{
    BucketsConfig, Collection, DuplicateHandling, FileDescriptor, Granule, GranuleFile,
};
use granary_common::{GranaryError, Result};
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_CONCURRENCY;
use crate::provider::ProviderClient;
use crate::transfer::duplicate_handling_type;

/// System of record for granules already ingested
#[async_trait]
pub trait GranuleRegistry: Send + Sync {
    async fn granule_exists(&self, granule_id: &str, collection_id: &str) -> Result<bool>;
}

/// Task-level discovery settings; each overrides the collection's value
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub provider_path: Option<String>,
    pub duplicate_handling: Option<DuplicateHandling>,
    pub ignore_files_config_for_discovery: Option<bool>,
    /// Parallel existence checks against the registry
    pub concurrency: usize,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            provider_path: None,
            duplicate_handling: None,
            ignore_files_config_for_discovery: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Group files by granule ID in first-seen order
///
/// Files whose name does not match `granule_id_regex` are dropped.
pub fn group_files<'a>(
    granule_id_regex: &Regex,
    files: &'a [FileDescriptor],
) -> Vec<(String, Vec<&'a FileDescriptor>)> {
    let mut groups: Vec<(String, Vec<&FileDescriptor>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for file in files {
        let Some(granule_id) = granule_id_regex
            .captures(&file.name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
        else {
            debug!(file = %file.name, "File does not match granuleIdExtraction, dropping");
            continue;
        };

        match index.get(&granule_id) {
            Some(&i) => groups[i].1.push(file),
            None => {
                index.insert(granule_id.clone(), groups.len());
                groups.push((granule_id, vec![file]));
            },
        }
    }
    groups
}

/// Attach bucket, type and URL path from the first matching file config
///
/// Files matching no config are dropped unless `ignore_files_config` is set,
/// in which case they pass through untyped.
pub fn classify_files(
    collection: &Collection,
    buckets: &BucketsConfig,
    files: &[&FileDescriptor],
    ignore_files_config: bool,
) -> Result<Vec<GranuleFile>> {
    let mut classified = Vec::with_capacity(files.len());
    for file in files {
        let mut granule_file = GranuleFile::from_descriptor(file);
        match collection.file_config_for(&file.name)? {
            Some(config) => {
                granule_file.bucket = Some(buckets.resolve(&config.bucket)?.to_string());
                granule_file.file_type = config.file_type.clone();
                granule_file.url_path = config.url_path.clone().or_else(|| collection.url_path.clone());
            },
            None if ignore_files_config => {},
            None => {
                debug!(file = %file.name, "File matches no file config, dropping");
                continue;
            },
        }
        classified.push(granule_file);
    }
    Ok(classified)
}

/// Turn a flat listing into granules of `collection`
pub fn build_granules(
    collection: &Collection,
    buckets: &BucketsConfig,
    files: &[FileDescriptor],
    ignore_files_config: bool,
) -> Result<Vec<Granule>> {
    let regex = collection.granule_id_regex()?;
    if regex.captures_len() < 2 {
        return Err(GranaryError::InvalidArgument(format!(
            "granuleIdExtraction '{}' has no capture group",
            collection.granule_id_extraction
        )));
    }

    group_files(&regex, files)
        .into_iter()
        .map(|(granule_id, files)| {
            Ok(Granule {
                granule_id,
                data_type: collection.name.clone(),
                version: collection.version.clone(),
                files: classify_files(collection, buckets, &files, ignore_files_config)?,
                published: false,
            })
        })
        .collect()
}

/// Apply the granule-level duplicate policy against the registry
///
/// `skip` drops granules that already exist and `error` fails on the first
/// one found; `replace` and `version` keep everything.
pub async fn handle_duplicate_granules(
    registry: &dyn GranuleRegistry,
    granules: Vec<Granule>,
    collection_id: &str,
    policy: DuplicateHandling,
    concurrency: usize,
) -> Result<Vec<Granule>> {
    if matches!(policy, DuplicateHandling::Replace | DuplicateHandling::Version) {
        return Ok(granules);
    }

    let checked: Vec<(Granule, bool)> = stream::iter(granules)
        .map(|granule| async move {
            let exists = registry.granule_exists(&granule.granule_id, collection_id).await?;
            Ok::<_, GranaryError>((granule, exists))
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let mut kept = Vec::with_capacity(checked.len());
    for (granule, exists) in checked {
        if !exists {
            kept.push(granule);
        } else if policy == DuplicateHandling::Error {
            return Err(GranaryError::DuplicateFile(format!(
                "A granule already exists for granuleId: {}",
                granule.granule_id
            )));
        } else {
            info!(granule_id = %granule.granule_id, "Granule already exists, skipping");
        }
    }
    Ok(kept)
}

/// List the provider and emit every new granule of `collection`
///
/// The client is closed whether or not discovery succeeds.
#[instrument(skip_all, fields(collection = %collection.collection_id()))]
pub async fn discover_granules(
    client: &dyn ProviderClient,
    collection: &Collection,
    buckets: &BucketsConfig,
    registry: Option<&dyn GranuleRegistry>,
    options: &DiscoverOptions,
) -> Result<Vec<Granule>> {
    let result = discover(client, collection, buckets, registry, options).await;
    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close provider session");
    }
    result
}

async fn discover(
    client: &dyn ProviderClient,
    collection: &Collection,
    buckets: &BucketsConfig,
    registry: Option<&dyn GranuleRegistry>,
    options: &DiscoverOptions,
) -> Result<Vec<Granule>> {
    let path = options
        .provider_path
        .as_deref()
        .or(collection.provider_path.as_deref())
        .unwrap_or("/");
    let ignore_files_config = options
        .ignore_files_config_for_discovery
        .or(collection.ignore_files_config_for_discovery)
        .unwrap_or(false);

    let files = client.list(path).await.inspect_err(|e| {
        warn!(%path, protocol = %client.protocol(), error = %e, "Listing failed, aborting discovery");
    })?;
    info!(%path, files = files.len(), "Listed provider");

    let granules = build_granules(collection, buckets, &files, ignore_files_config)?;

    let granules = match registry {
        Some(registry) => {
            let policy = duplicate_handling_type(options.duplicate_handling, collection.duplicate_handling, false);
            handle_duplicate_granules(registry, granules, &collection.collection_id(), policy, options.concurrency)
                .await?
        },
        None => granules,
    };

    info!(granules = granules.len(), "Discovered granules");
    Ok(granules)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::provider::{Protocol, SyncedObject};
    use granary_common::types::{BucketConfig, CollectionFileConfig};
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ListingProvider {
        files: Option<Vec<FileDescriptor>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl ProviderClient for ListingProvider {
        fn protocol(&self) -> Protocol {
            Protocol::Ftp
        }

        async fn list(&self, path: &str) -> Result<Vec<FileDescriptor>> {
            self.files
                .clone()
                .ok_or_else(|| GranaryError::RemoteResource(format!("Connection refused listing {}", path)))
        }

        async fn download(&self, remote_path: &str, _local_path: &Path) -> Result<PathBuf> {
            Err(GranaryError::FileNotFound(remote_path.into()))
        }

        async fn sync(&self, remote_path: &str, _bucket: &str, _key: &str) -> Result<SyncedObject> {
            Err(GranaryError::FileNotFound(remote_path.into()))
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct KnownGranules(HashSet<String>);

    #[async_trait]
    impl GranuleRegistry for KnownGranules {
        async fn granule_exists(&self, granule_id: &str, _collection_id: &str) -> Result<bool> {
            Ok(self.0.contains(granule_id))
        }
    }

    fn collection(ignore: Option<bool>) -> Collection {
        Collection {
            name: "MOD".into(),
            version: "006".into(),
            granule_id_extraction: r"^(MOD\.\d+)\..*".into(),
            files: vec![
                CollectionFileConfig {
                    regex: r"^MOD\.\d+\.hdf$".into(),
                    bucket: "protected".into(),
                    url_path: None,
                    file_type: Some("data".into()),
                    sample_file_name: None,
                },
                CollectionFileConfig {
                    regex: r"^MOD\.\d+\.jpg$".into(),
                    bucket: "public".into(),
                    url_path: Some("browse".into()),
                    file_type: Some("browse".into()),
                    sample_file_name: None,
                },
            ],
            url_path: Some("MOD/006".into()),
            provider_path: Some("/data".into()),
            duplicate_handling: None,
            ignore_files_config_for_discovery: ignore,
        }
    }

    fn buckets() -> BucketsConfig {
        BucketsConfig(HashMap::from([
            ("protected".to_string(), BucketConfig { name: "prot".into(), bucket_type: None }),
            ("public".to_string(), BucketConfig { name: "pub".into(), bucket_type: None }),
        ]))
    }

    fn listing(names: &[&str]) -> Vec<FileDescriptor> {
        names
            .iter()
            .map(|name| FileDescriptor::new(*name, Some("data".into()), 10))
            .collect()
    }

    fn provider(files: Option<Vec<FileDescriptor>>) -> ListingProvider {
        ListingProvider { files, closed: AtomicUsize::new(0) }
    }

    #[test]
    fn test_group_files_first_seen_order() {
        let regex = Regex::new(r"^(G\d)\.").unwrap();
        let files = listing(&["G2.a", "G1.a", "readme", "G2.b"]);
        let groups = group_files(&regex, &files);

        let ids: Vec<&str> = groups.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["G2", "G1"]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_classification_attaches_bucket_and_url_path() {
        let files = listing(&["MOD.1.hdf", "MOD.1.jpg"]);
        let granules = build_granules(&collection(None), &buckets(), &files, false).unwrap();

        assert_eq!(granules.len(), 1);
        let files = &granules[0].files;
        assert_eq!(files[0].bucket.as_deref(), Some("prot"));
        assert_eq!(files[0].url_path.as_deref(), Some("MOD/006"));
        assert_eq!(files[1].file_type.as_deref(), Some("browse"));
        assert_eq!(files[1].url_path.as_deref(), Some("browse"));
        assert_eq!(files[1].path.as_deref(), Some("data"));
    }

    #[test]
    fn test_strict_collection_keeps_empty_granule() {
        let files = listing(&["MOD.1.hdf", "MOD.2.xml"]);
        let granules = build_granules(&collection(None), &buckets(), &files, false).unwrap();

        assert_eq!(granules.len(), 2);
        assert_eq!(granules[1].granule_id, "MOD.2");
        assert!(granules[1].files.is_empty());
    }

    #[test]
    fn test_ignore_files_config_passes_untyped_files() {
        let files = listing(&["MOD.2.xml"]);
        let granules = build_granules(&collection(None), &buckets(), &files, true).unwrap();
        let file = &granules[0].files[0];
        assert_eq!(file.name, "MOD.2.xml");
        assert!(file.bucket.is_none());
        assert!(file.file_type.is_none());
    }

    #[test]
    fn test_regex_without_capture_group_rejected() {
        let mut collection = collection(None);
        collection.granule_id_extraction = r"^MOD\..*".into();
        let err = build_granules(&collection, &buckets(), &listing(&["MOD.1.hdf"]), false).unwrap_err();
        assert!(matches!(err, GranaryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_task_ignore_flag_overrides_collection() {
        let client = provider(Some(listing(&["MOD.1.hdf", "MOD.1.xml"])));
        let options = DiscoverOptions { ignore_files_config_for_discovery: Some(false), ..Default::default() };

        let granules = discover_granules(&client, &collection(Some(true)), &buckets(), None, &options)
            .await
            .unwrap();
        assert_eq!(granules[0].files.len(), 1);
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_and_closes() {
        let client = provider(None);
        let err = discover_granules(&client, &collection(None), &buckets(), None, &DiscoverOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GranaryError::RemoteResource(_)));
        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_skip_and_error() {
        let registry = KnownGranules(HashSet::from(["MOD.1".to_string()]));
        let client = provider(Some(listing(&["MOD.1.hdf", "MOD.2.hdf"])));

        let skip = DiscoverOptions { duplicate_handling: Some(DuplicateHandling::Skip), ..Default::default() };
        let granules = discover_granules(&client, &collection(None), &buckets(), Some(&registry), &skip)
            .await
            .unwrap();
        assert_eq!(granules.len(), 1);
        assert_eq!(granules[0].granule_id, "MOD.2");

        let err = discover_granules(&client, &collection(None), &buckets(), Some(&registry), &DiscoverOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("MOD.1"));

        let replace = DiscoverOptions { duplicate_handling: Some(DuplicateHandling::Replace), ..Default::default() };
        let granules = discover_granules(&client, &collection(None), &buckets(), Some(&registry), &replace)
            .await
            .unwrap();
        assert_eq!(granules.len(), 2);
    }
}
