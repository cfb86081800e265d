//! Transfer engine
//!
//! Stages every file of a granule into the object store at
//! `<fileStagingDir>/<collectionId>/<fileName>`, resolves collisions with
//! existing objects under the granule's duplicate policy and verifies what
//! was written.

use futures::stream::{self, StreamExt};
use granary_common::types::{
    BucketsConfig, Collection, DuplicateHandling, Granule, GranuleFile,
};
use granary_common::{GranaryError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_FILE_STAGING_DIR};
use crate::provider::ProviderClient;
use crate::store::{join_key, store_uri, ObjectMeta, ObjectStore};

pub mod checksum_files;
pub mod duplicate;
pub mod verify;

pub use checksum_files::{add_checksums_to_files, is_checksum_file};
pub use duplicate::{
    duplicate_handling_type, is_versioned_filename, list_versioned_objects, move_with_versioning,
    rename_with_timestamp, unversion_filename,
};
pub use verify::verify_file;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub file_staging_dir: String,
    pub duplicate_handling: DuplicateHandling,
    /// Files of one granule staged at the same time
    pub concurrency: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            file_staging_dir: DEFAULT_FILE_STAGING_DIR.to_string(),
            duplicate_handling: DuplicateHandling::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

pub struct GranuleTransfer {
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn ProviderClient>,
    collection: Collection,
    buckets: BucketsConfig,
    options: TransferOptions,
}

impl GranuleTransfer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn ProviderClient>,
        collection: Collection,
        buckets: BucketsConfig,
        options: TransferOptions,
    ) -> Self {
        Self {
            store,
            client,
            collection,
            buckets,
            options,
        }
    }

    /// `<fileStagingDir>/<collectionId>`, without a leading slash
    pub fn staging_prefix(&self, collection_id: &str) -> String {
        join_key([self.options.file_staging_dir.as_str(), collection_id])
    }

    /// Bucket a file is staged in, from its collection file config
    pub fn destination_bucket(&self, file: &GranuleFile) -> Result<String> {
        let config = self.collection.file_config_for(&file.name)?.ok_or_else(|| {
            GranaryError::InvalidArgument(format!(
                "Unable to update file. Cannot find file config for file {}",
                file.name
            ))
        })?;
        Ok(self.buckets.resolve(&config.bucket)?.to_string())
    }

    fn url_path_for(&self, file: &GranuleFile) -> Result<Option<String>> {
        Ok(self
            .collection
            .file_config_for(&file.name)?
            .and_then(|config| config.url_path.clone())
            .or_else(|| self.collection.url_path.clone()))
    }

    /// Stage every file of `granule`
    ///
    /// All files are attempted even when some fail; the first failure is
    /// returned once every sibling has finished.
    #[instrument(skip(self, granule), fields(granule_id = %granule.granule_id))]
    pub async fn ingest_granule(&self, granule: &Granule) -> Result<Granule> {
        let data_type = if granule.data_type.is_empty() { &self.collection.name } else { &granule.data_type };
        let version = if granule.version.is_empty() { &self.collection.version } else { &granule.version };
        let collection_id = granary_common::types::collection_id(data_type, version);

        let files = add_checksums_to_files(self.client.as_ref(), &granule.files).await?;
        info!(files = files.len(), %collection_id, "Staging granule files");

        // Files sharing a destination run one after another so each sees the
        // object its predecessor left behind.
        let files = &files;
        let collection_id = collection_id.as_str();
        let groups = self.group_by_destination(files, collection_id);
        let mut results: Vec<(usize, Result<Vec<GranuleFile>>)> = stream::iter(groups)
            .map(move |indices| async move {
                let mut out = Vec::with_capacity(indices.len());
                for index in indices {
                    out.push((index, self.ingest_file(&files[index], collection_id).await));
                }
                out
            })
            .buffered(self.options.concurrency.max(1))
            .flat_map(stream::iter)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut staged = Vec::new();
        let mut first_error = None;
        for (file, (_, result)) in files.iter().zip(results) {
            match result {
                Ok(mut files) => staged.append(&mut files),
                Err(e) => {
                    error!(file = %file.name, remote = %file.remote_path(), error = %e, "Failed to stage file");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                },
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(Granule {
            granule_id: granule.granule_id.clone(),
            data_type: data_type.clone(),
            version: version.clone(),
            files: staged,
            published: granule.published,
        })
    }

    /// Indices of `files` grouped by staging location, in first-seen order.
    /// A file whose bucket cannot be resolved gets a group of its own.
    fn group_by_destination(&self, files: &[GranuleFile], collection_id: &str) -> Vec<Vec<usize>> {
        let staging_prefix = self.staging_prefix(collection_id);
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut by_location: HashMap<(String, String), usize> = HashMap::new();

        for (index, file) in files.iter().enumerate() {
            let Ok(bucket) = self.destination_bucket(file) else {
                groups.push(vec![index]);
                continue;
            };
            let key = join_key([staging_prefix.as_str(), file.name.as_str()]);
            match by_location.entry((bucket, key)) {
                Entry::Occupied(slot) => groups[*slot.get()].push(index),
                Entry::Vacant(slot) => {
                    slot.insert(groups.len());
                    groups.push(vec![index]);
                },
            }
        }
        groups
    }

    /// Stage several granules; one granule's failure does not stop the others
    pub async fn ingest_granules(&self, granules: &[Granule]) -> Vec<Result<Granule>> {
        let mut results = Vec::with_capacity(granules.len());
        for granule in granules {
            results.push(self.ingest_granule(granule).await);
        }
        results
    }

    /// Stage one file, returning it plus any versioned siblings
    #[instrument(skip(self, file), fields(file = %file.name))]
    pub async fn ingest_file(&self, file: &GranuleFile, collection_id: &str) -> Result<Vec<GranuleFile>> {
        let bucket = self.destination_bucket(file)?;
        let staging_prefix = self.staging_prefix(collection_id);
        let key = join_key([staging_prefix.as_str(), file.name.as_str()]);
        let remote_path = file.remote_path();
        let url_path = self.url_path_for(file)?;

        let mut staged = GranuleFile {
            bucket: Some(bucket.clone()),
            key: Some(key.clone()),
            source: Some(store_uri(&bucket, &key)),
            file_staging_dir: Some(staging_prefix.clone()),
            url_path: url_path.clone(),
            ..file.clone()
        };

        let store = self.store.as_ref();
        let mut versions: Vec<ObjectMeta> = Vec::new();

        if store.exists(&bucket, &key).await? {
            staged.duplicate_found = Some(true);
            let policy = self.options.duplicate_handling;
            debug!(uri = %store_uri(&bucket, &key), %policy, "Destination already exists");

            match policy {
                DuplicateHandling::Error => {
                    return Err(GranaryError::DuplicateFile(format!(
                        "{} already exists in {} bucket",
                        key, bucket
                    )));
                },
                // The existing object is trusted as-is and not re-verified.
                DuplicateHandling::Skip => {},
                DuplicateHandling::Replace => {
                    self.client.sync(&remote_path, &bucket, &key).await?;
                    verify_file(store, file, &bucket, &key).await?;
                },
                DuplicateHandling::Version => {
                    let temp_key = format!("{}.{}", key, Uuid::new_v4());
                    self.client.sync(&remote_path, &bucket, &temp_key).await?;
                    let declared = verify_file(store, file, &bucket, &temp_key).await?;
                    versions = move_with_versioning(
                        store,
                        (&bucket, &temp_key),
                        (&bucket, &key),
                        declared.as_ref().map(|(alg, value)| (*alg, value.as_str())),
                    )
                    .await?;
                },
            }
        } else {
            self.client.sync(&remote_path, &bucket, &key).await?;
            verify_file(store, file, &bucket, &key).await?;
        }

        staged.size = Some(store.size_of(&bucket, &key).await?);

        let mut result = vec![staged];
        result.extend(versions.into_iter().map(|version| GranuleFile {
            name: version.key.rsplit('/').next().unwrap_or(&version.key).to_string(),
            path: file.path.clone(),
            bucket: Some(version.bucket.clone()),
            source: Some(version.uri()),
            key: Some(version.key),
            size: Some(version.size),
            file_staging_dir: Some(staging_prefix.clone()),
            url_path: url_path.clone(),
            ..Default::default()
        }));
        Ok(result)
    }
}
