//! Post-transfer integrity checks against the stored object

use granary_common::types::{ChecksumAlgorithm, GranuleFile};
use granary_common::{GranaryError, Result};
use tracing::{debug, warn};

use crate::store::{store_uri, validate_object_checksum, ObjectStore};

/// Verify the object at `bucket/key` against what `file` declares
///
/// A declared checksum takes precedence over a declared size. A size of zero
/// counts as undeclared since several listings cannot report sizes. Returns
/// the declared checksum, if any, for later comparisons.
pub async fn verify_file(
    store: &dyn ObjectStore,
    file: &GranuleFile,
    bucket: &str,
    key: &str,
) -> Result<Option<(ChecksumAlgorithm, String)>> {
    if let (Some(algorithm), Some(expected)) = (file.checksum_type, file.checksum.as_deref()) {
        validate_object_checksum(store, bucket, key, algorithm, expected).await?;
        debug!(file = %file.name, %algorithm, "Checksum verified");
        return Ok(Some((algorithm, expected.to_string())));
    }

    match file.size.filter(|size| *size > 0) {
        Some(expected) => {
            let actual = store.size_of(bucket, key).await?;
            if actual != expected {
                return Err(GranaryError::UnexpectedFileSize {
                    file: format!("{} ({})", file.name, store_uri(bucket, key)),
                    expected,
                    actual,
                });
            }
            debug!(file = %file.name, size = actual, "Size verified");
        },
        None => warn!(file = %file.name, "No checksum or size declared, skipping verification"),
    }
    Ok(None)
}
