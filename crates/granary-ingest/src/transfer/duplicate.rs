//! Duplicate resolution for staged objects
//!
//! The `version` policy keeps every distinct copy of a file: the object
//! already at the key is renamed to `<key>.vYYYYMMDDTHHmmssSSS`, using its own
//! last-modified time, and the new copy takes its place.

use chrono::{DateTime, Duration, Utc};
use granary_common::checksum::checksums_match;
use granary_common::types::{ChecksumAlgorithm, DuplicateHandling};
use granary_common::{GranaryError, Result};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::store::{calculate_object_checksum, store_uri, ObjectMeta, ObjectStore};

const VERSION_FORMAT: &str = "%Y%m%dT%H%M%S%3f";

static VERSION_SUFFIX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"\.v[0-9]{4}(0[1-9]|1[0-2])(0[1-9]|[1-2][0-9]|3[0-1])T(2[0-3]|[01][0-9])[0-5][0-9][0-5][0-9][0-9]{3}$",
    )
    .ok()
});

/// Effective policy: a forced overwrite wins, then the task, then the collection
pub fn duplicate_handling_type(
    task: Option<DuplicateHandling>,
    collection: Option<DuplicateHandling>,
    force_overwrite: bool,
) -> DuplicateHandling {
    if force_overwrite {
        return DuplicateHandling::Replace;
    }
    task.or(collection).unwrap_or_default()
}

/// Whether `name` carries a `.vYYYYMMDDTHHmmssSSS` suffix
pub fn is_versioned_filename(name: &str) -> bool {
    VERSION_SUFFIX.as_ref().is_some_and(|re| re.is_match(name))
}

/// Strip a version suffix, if any
pub fn unversion_filename(name: &str) -> &str {
    if is_versioned_filename(name) {
        name.rsplit_once('.').map(|(base, _)| base).unwrap_or(name)
    } else {
        name
    }
}

/// Versioned key for `key` at `timestamp`
pub fn versioned_key(key: &str, timestamp: DateTime<Utc>) -> String {
    format!("{}.v{}", key, timestamp.format(VERSION_FORMAT))
}

/// Rename the object at `key` to a free timestamped name, returning the new key
///
/// Candidates start at the object's last-modified time and advance one
/// millisecond at a time until an unused name is found.
pub async fn rename_with_timestamp(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<String> {
    let meta = store
        .head(bucket, key)
        .await?
        .ok_or_else(|| GranaryError::FileNotFound(store_uri(bucket, key)))?;

    let mut timestamp = meta.last_modified;
    let mut renamed = versioned_key(key, timestamp);
    while store.exists(bucket, &renamed).await? {
        timestamp += Duration::milliseconds(1);
        renamed = versioned_key(key, timestamp);
    }

    debug!(from = %store_uri(bucket, key), to = %renamed, "Renaming existing object");
    store.move_object(bucket, key, bucket, &renamed).await?;
    Ok(renamed)
}

/// Every versioned sibling of `key`
pub async fn list_versioned_objects(store: &dyn ObjectStore, bucket: &str, key: &str) -> Result<Vec<ObjectMeta>> {
    let prefix = format!("{}.v", key);
    Ok(store
        .list_prefix(bucket, &prefix)
        .await?
        .into_iter()
        .filter(|object| unversion_filename(&object.key) == key)
        .collect())
}

/// Move `source` onto `target`, keeping the existing target as a version
///
/// When both objects hold the same bytes the source copy is discarded and the
/// target is left alone. Returns every versioned sibling of the target.
pub async fn move_with_versioning(
    store: &dyn ObjectStore,
    source: (&str, &str),
    target: (&str, &str),
    source_checksum: Option<(ChecksumAlgorithm, &str)>,
) -> Result<Vec<ObjectMeta>> {
    let (source_bucket, source_key) = source;
    let (target_bucket, target_key) = target;

    let algorithm = source_checksum.map(|(alg, _)| alg).unwrap_or(ChecksumAlgorithm::Cksum);
    let target_sum = calculate_object_checksum(store, target_bucket, target_key, algorithm).await?;
    let source_sum = match source_checksum {
        Some((_, value)) => value.to_string(),
        None => calculate_object_checksum(store, source_bucket, source_key, algorithm).await?,
    };

    if checksums_match(&source_sum, &target_sum) {
        info!(
            target = %store_uri(target_bucket, target_key),
            "New copy is identical to the existing object, keeping the original"
        );
        store.delete(source_bucket, source_key).await?;
    } else {
        rename_with_timestamp(store, target_bucket, target_key).await?;
        store
            .move_object(source_bucket, source_key, target_bucket, target_key)
            .await?;
    }

    list_versioned_objects(store, target_bucket, target_key).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use chrono::TimeZone;

    #[test]
    fn test_duplicate_handling_type() {
        use DuplicateHandling::*;
        assert_eq!(duplicate_handling_type(None, None, false), Error);
        assert_eq!(duplicate_handling_type(None, Some(Version), false), Version);
        assert_eq!(duplicate_handling_type(Some(Skip), Some(Version), false), Skip);
        assert_eq!(duplicate_handling_type(Some(Skip), None, true), Replace);
    }

    #[test]
    fn test_versioned_names() {
        assert!(is_versioned_filename("a.txt.v20200102T030405006"));
        assert!(!is_versioned_filename("a.txt.v20201302T030405006"));
        assert!(!is_versioned_filename("a.txt"));
        assert_eq!(unversion_filename("dir/a.txt.v20200102T030405006"), "dir/a.txt");
        assert_eq!(unversion_filename("a.v1.txt"), "a.v1.txt");
    }

    #[test]
    fn test_versioned_key_format() {
        let ts = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap() + Duration::milliseconds(89);
        assert_eq!(versioned_key("k/a.hdf", ts), "k/a.hdf.v20210304T050607089");
    }

    #[tokio::test]
    async fn test_rename_skips_taken_names() {
        let store = MemoryObjectStore::new();
        let ts = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        store.insert_at("b", "a.txt", "new", ts).await;
        store.insert("b", &versioned_key("a.txt", ts), "old").await;

        let renamed = rename_with_timestamp(&store, "b", "a.txt").await.unwrap();
        assert_eq!(renamed, versioned_key("a.txt", ts + Duration::milliseconds(1)));
        assert!(!store.exists("b", "a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_identical_copy_is_discarded() {
        let store = MemoryObjectStore::new();
        store.insert("b", "a.txt", "A").await;
        store.insert("b", "a.txt.tmp", "A").await;

        let versions = move_with_versioning(&store, ("b", "a.txt.tmp"), ("b", "a.txt"), None)
            .await
            .unwrap();
        assert!(versions.is_empty());
        assert_eq!(store.keys("b").await, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_different_copy_versions_the_original() {
        let store = MemoryObjectStore::new();
        store.insert("b", "a.txt", "old").await;
        store.insert("b", "a.txt.tmp", "new").await;

        let versions = move_with_versioning(&store, ("b", "a.txt.tmp"), ("b", "a.txt"), None)
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
        assert!(is_versioned_filename(&versions[0].key));
        assert_eq!(store.get_bytes("b", "a.txt").await.unwrap().as_ref(), b"new");
        assert_eq!(store.get_bytes("b", &versions[0].key).await.unwrap().as_ref(), b"old");
    }
}
