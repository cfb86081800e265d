//! Checksum side-car files
//!
//! Providers often publish `G.hdf.md5` next to `G.hdf`. Side-cars are not
//! staged; their contents become the declared checksum of the data file.

use futures::future::try_join_all;
use granary_common::types::{ChecksumAlgorithm, GranuleFile};
use granary_common::Result;
use tracing::debug;

use crate::provider::{fetch_text_file, ProviderClient};

pub fn is_checksum_file(name: &str) -> bool {
    ChecksumAlgorithm::SIDECAR_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// First whitespace-separated token of a side-car, as `md5sum` and `cksum` write it
pub fn parse_checksum_file(contents: &str) -> Option<String> {
    contents.split_whitespace().next().map(str::to_string)
}

fn sidecar_for<'a>(data_file: &GranuleFile, sidecars: &[&'a GranuleFile]) -> Option<&'a GranuleFile> {
    sidecars.iter().copied().find(|sidecar| {
        sidecar
            .name
            .strip_prefix(data_file.name.as_str())
            .is_some_and(|ext| ChecksumAlgorithm::SIDECAR_EXTENSIONS.contains(&ext))
    })
}

/// Split out side-cars and fill in declared checksums for the data files
///
/// Only data files are returned. Files that already declare both a checksum
/// type and value keep them.
pub async fn add_checksums_to_files(
    client: &dyn ProviderClient,
    files: &[GranuleFile],
) -> Result<Vec<GranuleFile>> {
    let (sidecars, data_files): (Vec<&GranuleFile>, Vec<&GranuleFile>) =
        files.iter().partition(|f| is_checksum_file(&f.name));

    try_join_all(data_files.into_iter().map(|data_file| {
        let sidecar = sidecar_for(data_file, &sidecars);
        async move {
            let mut file = data_file.clone();
            if file.checksum_type.is_some() && file.checksum.is_some() {
                return Ok(file);
            }
            let Some(sidecar) = sidecar else {
                return Ok(file);
            };

            let contents = fetch_text_file(client, &sidecar.remote_path()).await?;
            file.checksum = parse_checksum_file(&contents);
            file.checksum_type =
                Some(ChecksumAlgorithm::from_sidecar_name(&sidecar.name).unwrap_or(ChecksumAlgorithm::Md5));
            debug!(file = %file.name, sidecar = %sidecar.name, "Declared checksum read from side-car");
            Ok(file)
        }
    }))
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_is_checksum_file() {
        assert!(is_checksum_file("G.hdf.md5"));
        assert!(is_checksum_file("G.hdf.sha256"));
        assert!(!is_checksum_file("G.hdf"));
        assert!(!is_checksum_file("G.hdf.sha512"));
    }

    #[test]
    fn test_parse_checksum_file() {
        assert_eq!(
            parse_checksum_file("5eb63bbbe01eeed093cb22bb8f5acdc3  G.hdf\n").as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(parse_checksum_file("1135714720 11 G.hdf").as_deref(), Some("1135714720"));
        assert_eq!(parse_checksum_file("  \n"), None);
    }

    #[test]
    fn test_sidecar_matching_requires_exact_base() {
        let data = GranuleFile { name: "G.hdf".into(), ..Default::default() };
        let other = GranuleFile { name: "G.hdf.met.md5".into(), ..Default::default() };
        let own = GranuleFile { name: "G.hdf.cksum".into(), ..Default::default() };

        assert!(sidecar_for(&data, &[&other]).is_none());
        assert_eq!(sidecar_for(&data, &[&other, &own]).unwrap().name, "G.hdf.cksum");
    }
}
