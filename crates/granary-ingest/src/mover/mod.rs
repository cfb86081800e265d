//! Granule move engine
//!
//! Relocates already-staged files to the first [`Destination`] whose regex
//! matches each file name. A pre-flight pass classifies every file before any
//! byte moves, so an overwrite conflict, or two files landing on the same
//! target, aborts the whole move untouched.
//! Moves are copy-then-delete, which makes re-running an interrupted move safe:
//! files found at both locations with identical content only need the delete
//! replayed.

use futures::stream::{self, StreamExt, TryStreamExt};
use granary_common::types::{compile_regex, ChecksumAlgorithm, Destination, Granule, GranuleFile};
use granary_common::{GranaryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_CONCURRENCY;
use crate::store::{calculate_object_checksum, join_key, parse_store_uri, store_uri, ObjectStore};

pub mod metadata;

pub use metadata::{
    online_access_url, DistributionUrlUpdater, FileLocation, HttpMetadataUpdater, MetadataUpdate,
    MetadataUpdater,
};

#[derive(Debug, Clone)]
pub struct MoveOptions {
    /// Fail when a file matches no destination instead of leaving it in place
    pub strict: bool,
    pub distribution_endpoint: Option<String>,
    pub concurrency: usize,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            strict: false,
            distribution_endpoint: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    pub granule: Granule,
    /// Set when the granule carries a metadata document and an updater ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_access_urls: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Location {
    bucket: String,
    key: String,
}

impl Location {
    fn uri(&self) -> String {
        store_uri(&self.bucket, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// No destination matched; the file stays where it is
    Unmatched,
    /// Source and target are the same object
    InPlace,
    Move,
    /// Only the target exists: an earlier run completed this file
    AlreadyMoved,
    /// Both exist with identical content: an earlier run stopped before the delete
    DeleteSource,
    Conflict,
}

#[derive(Debug)]
struct FilePlan {
    action: Action,
    source: Location,
    target: Option<Location>,
}

fn source_location(file: &GranuleFile) -> Result<Location> {
    match (&file.bucket, &file.key, &file.source) {
        (Some(bucket), Some(key), _) => Ok(Location { bucket: bucket.clone(), key: key.clone() }),
        (_, _, Some(uri)) => {
            let (bucket, key) = parse_store_uri(uri)?;
            Ok(Location { bucket, key })
        },
        _ => Err(GranaryError::InvalidArgument(format!(
            "File {} has no bucket/key or source to move from",
            file.name
        ))),
    }
}

fn file_base_name(file: &GranuleFile) -> &str {
    file.name.rsplit('/').next().unwrap_or(&file.name)
}

pub struct GranuleMover {
    store: Arc<dyn ObjectStore>,
    updater: Option<Arc<dyn MetadataUpdater>>,
    options: MoveOptions,
}

impl GranuleMover {
    pub fn new(store: Arc<dyn ObjectStore>, options: MoveOptions) -> Self {
        Self {
            store,
            updater: None,
            options,
        }
    }

    pub fn with_metadata_updater(mut self, updater: Arc<dyn MetadataUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Move every file of `granule` to its matching destination
    #[instrument(skip_all, fields(granule_id = %granule.granule_id))]
    pub async fn move_granule_files(&self, granule: &Granule, destinations: &[Destination]) -> Result<MoveResult> {
        let destinations = destinations
            .iter()
            .map(|d| Ok((compile_regex(&d.regex)?, d)))
            .collect::<Result<Vec<_>>>()?;

        let concurrency = self.options.concurrency.max(1);
        let plans: Vec<FilePlan> = stream::iter(granule.files.iter())
            .map(|file| {
                let destination = destinations
                    .iter()
                    .find(|(regex, _)| regex.is_match(&file.name))
                    .map(|(_, d)| *d);
                self.plan_file(file, destination)
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        let mut claims: HashMap<&Location, usize> = HashMap::new();
        for target in plans.iter().filter_map(|plan| plan.target.as_ref()) {
            *claims.entry(target).or_default() += 1;
        }
        let conflicts: Vec<String> = granule
            .files
            .iter()
            .zip(&plans)
            .filter(|(_, plan)| {
                plan.action == Action::Conflict || plan.target.as_ref().is_some_and(|t| claims[t] > 1)
            })
            .map(|(file, _)| file.name.clone())
            .collect();
        if !conflicts.is_empty() {
            warn!(files = ?conflicts, "Refusing to overwrite existing or shared targets");
            return Err(GranaryError::OverwriteConflict { files: conflicts });
        }

        stream::iter(plans.iter())
            .map(|plan| self.execute(plan))
            .buffered(concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        let files: Vec<GranuleFile> = granule
            .files
            .iter()
            .zip(&plans)
            .map(|(file, plan)| match &plan.target {
                Some(target) => GranuleFile {
                    bucket: Some(target.bucket.clone()),
                    key: Some(target.key.clone()),
                    source: Some(target.uri()),
                    ..file.clone()
                },
                None => file.clone(),
            })
            .collect();

        let moved = Granule { files, ..granule.clone() };
        let online_access_urls = self.update_metadata(&moved).await?;
        info!(files = moved.files.len(), "Granule files moved");

        Ok(MoveResult { granule: moved, online_access_urls })
    }

    async fn plan_file(&self, file: &GranuleFile, destination: Option<&Destination>) -> Result<FilePlan> {
        let source = source_location(file)?;
        let Some(destination) = destination else {
            if self.options.strict {
                return Err(GranaryError::InvalidArgument(format!(
                    "File {} matches no destination",
                    file.name
                )));
            }
            debug!(file = %file.name, "No destination matched, leaving file in place");
            return Ok(FilePlan { action: Action::Unmatched, source, target: None });
        };

        let target = Location {
            bucket: destination.bucket.clone(),
            key: join_key([destination.filepath.as_deref().unwrap_or(""), file_base_name(file)]),
        };
        if target == source {
            return Ok(FilePlan { action: Action::InPlace, source, target: Some(target) });
        }

        let store = self.store.as_ref();
        let (source_exists, target_exists) = tokio::try_join!(
            store.exists(&source.bucket, &source.key),
            store.exists(&target.bucket, &target.key)
        )?;

        let action = match (source_exists, target_exists) {
            (true, false) => Action::Move,
            (false, true) => Action::AlreadyMoved,
            (false, false) => {
                return Err(GranaryError::FileNotFound(format!(
                    "{} not found at {} or {}",
                    file.name,
                    source.uri(),
                    target.uri()
                )));
            },
            (true, true) => {
                let algorithm = file.checksum_type.unwrap_or(ChecksumAlgorithm::Md5);
                let (source_sum, target_sum) = tokio::try_join!(
                    calculate_object_checksum(store, &source.bucket, &source.key, algorithm),
                    calculate_object_checksum(store, &target.bucket, &target.key, algorithm)
                )?;
                if source_sum == target_sum {
                    Action::DeleteSource
                } else {
                    Action::Conflict
                }
            },
        };
        Ok(FilePlan { action, source, target: Some(target) })
    }

    async fn execute(&self, plan: &FilePlan) -> Result<()> {
        let source = &plan.source;
        match (&plan.action, &plan.target) {
            (Action::Move, Some(target)) => {
                info!(from = %source.uri(), to = %target.uri(), "Moving file");
                self.store
                    .move_object(&source.bucket, &source.key, &target.bucket, &target.key)
                    .await
            },
            (Action::DeleteSource, Some(target)) => {
                info!(from = %source.uri(), to = %target.uri(), "Completing interrupted move");
                self.store.delete(&source.bucket, &source.key).await
            },
            _ => Ok(()),
        }
    }

    async fn update_metadata(&self, granule: &Granule) -> Result<Option<Vec<String>>> {
        let Some(updater) = &self.updater else {
            return Ok(None);
        };
        if !granule.files.iter().any(GranuleFile::is_metadata_file) {
            return Ok(None);
        }

        let request = MetadataUpdate {
            granule_id: granule.granule_id.clone(),
            files: granule
                .files
                .iter()
                .filter_map(|file| {
                    Some(FileLocation { bucket: file.bucket.clone()?, key: file.key.clone()? })
                })
                .collect(),
            distribution_endpoint: self.options.distribution_endpoint.clone(),
            published: granule.published,
        };
        updater.update(&request).await.map(Some)
    }
}
