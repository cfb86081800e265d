//! Product delivery record parsing
//!
//! A PDR is an ODL document of `KEY = VALUE;` statements with nested
//! `OBJECT = NAME; ... END_OBJECT = NAME;` blocks. Each top-level `FILE_GROUP`
//! becomes one granule and each `FILE_SPEC` inside it one file of that granule.

use granary_common::types::{ChecksumAlgorithm, Granule, GranuleFile};
use granary_common::{GranaryError, Result};
use serde::{Deserialize, Serialize};

/// Granules announced by one PDR
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPdr {
    pub granules: Vec<Granule>,
    pub granules_count: usize,
    pub files_count: usize,
    /// Sum of every declared `FILE_SIZE`
    pub total_size: u64,
}

#[derive(Debug, Default)]
struct OdlObject {
    name: String,
    values: Vec<(String, String)>,
    children: Vec<OdlObject>,
}

impl OdlObject {
    fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn objects<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a OdlObject> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        rest = match rest[start + 2..].find("*/") {
            Some(end) => &rest[start + 2 + end + 2..],
            None => "",
        };
    }
    out.push_str(rest);
    out
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_odl(text: &str) -> std::result::Result<OdlObject, String> {
    let text = strip_comments(text);
    let mut root = OdlObject::default();
    let mut open: Vec<OdlObject> = Vec::new();

    for statement in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = match statement.split_once('=') {
            Some((key, value)) => (key.trim().to_ascii_uppercase(), unquote(value.trim()).to_string()),
            None => (statement.to_ascii_uppercase(), String::new()),
        };

        match key.as_str() {
            "OBJECT" | "GROUP" => open.push(OdlObject {
                name: value.to_ascii_uppercase(),
                ..Default::default()
            }),
            "END_OBJECT" | "END_GROUP" => {
                let Some(object) = open.pop() else {
                    return Err(format!("{} = {} has no matching OBJECT", key, value));
                };
                if !value.is_empty() && !value.eq_ignore_ascii_case(&object.name) {
                    return Err(format!("{} = {} closes OBJECT = {}", key, value, object.name));
                }
                open.last_mut().unwrap_or(&mut root).children.push(object);
            },
            "END" => break,
            _ => open.last_mut().unwrap_or(&mut root).values.push((key, value)),
        }
    }

    match open.last() {
        Some(object) => Err(format!("OBJECT = {} is never closed", object.name)),
        None => Ok(root),
    }
}

/// Granule file type for a PDR `FILE_TYPE`
fn granule_file_type(pdr_type: &str) -> Option<&'static str> {
    match pdr_type.to_ascii_uppercase().as_str() {
        "HDF" | "HDF-EOS" | "SCIENCE" | "NETCDF" | "TGZ" | "TAR" | "ZIP" | "ASCII" | "BINARY" => {
            Some("data")
        },
        "BROWSE" => Some("browse"),
        "METADATA" | "BROWSE_METADATA" | "QA_METADATA" => Some("metadata"),
        "QA" | "PRODUCT_HISTORY" => Some("qa"),
        _ => None,
    }
}

fn required<'a>(object: &'a OdlObject, key: &str) -> std::result::Result<&'a str, String> {
    object
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("MISSING {} PARAMETER", key))
}

fn parse_checksum(spec: &OdlObject) -> std::result::Result<Option<(ChecksumAlgorithm, String)>, String> {
    let (kind, value) = match (spec.get("FILE_CKSUM_TYPE"), spec.get("FILE_CKSUM_VALUE")) {
        (None, None) => return Ok(None),
        (Some(_), None) => return Err("MISSING FILE_CKSUM_VALUE PARAMETER".into()),
        (None, Some(_)) => return Err("MISSING FILE_CKSUM_TYPE PARAMETER".into()),
        (Some(kind), Some(value)) => (kind, value),
    };

    let algorithm: ChecksumAlgorithm = kind
        .parse()
        .map_err(|_| format!("UNSUPPORTED FILE_CKSUM_TYPE PARAMETER : {}", kind))?;
    let valid = match algorithm {
        ChecksumAlgorithm::Cksum => value.parse::<u32>().is_ok(),
        ChecksumAlgorithm::Md5 => value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit()),
        _ => !value.is_empty(),
    };
    if !valid {
        return Err(format!("Invalid {} checksum value: {}", algorithm, value));
    }
    Ok(Some((algorithm, value.to_string())))
}

fn parse_file_spec(spec: &OdlObject) -> std::result::Result<GranuleFile, String> {
    let name = required(spec, "FILE_ID")?;
    let size = required(spec, "FILE_SIZE")?;
    let size: u64 = size
        .parse()
        .map_err(|_| format!("INVALID FILE_SIZE PARAMETER : {}", size))?;
    let file_type = match spec.get("FILE_TYPE") {
        Some(kind) => Some(
            granule_file_type(kind).ok_or_else(|| format!("INVALID FILE_TYPE PARAMETER : {}", kind))?,
        ),
        None => None,
    };
    let checksum = parse_checksum(spec)?;

    Ok(GranuleFile {
        name: name.to_string(),
        path: Some(required(spec, "DIRECTORY_ID")?.to_string()),
        size: Some(size),
        file_type: file_type.map(str::to_string),
        checksum_type: checksum.as_ref().map(|(algorithm, _)| *algorithm),
        checksum: checksum.map(|(_, value)| value),
        ..Default::default()
    })
}

/// The data file's name without its extension, or the first file's when the
/// group declares no data file
fn granule_id(files: &[GranuleFile]) -> Option<String> {
    let file = files
        .iter()
        .find(|f| f.file_type.as_deref() == Some("data"))
        .or_else(|| files.first())?;
    let id = file.name.rsplit_once('.').map_or(file.name.as_str(), |(stem, _)| stem);
    Some(id.to_string())
}

fn parse_file_group(group: &OdlObject) -> std::result::Result<Granule, String> {
    let data_type = required(group, "DATA_TYPE")?;
    let version = required(group, "DATA_VERSION")?;
    let files = group
        .objects("FILE_SPEC")
        .map(parse_file_spec)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let granule_id = granule_id(&files).ok_or_else(|| format!("FILE_GROUP {} has no FILE_SPEC", data_type))?;

    Ok(Granule {
        granule_id,
        data_type: data_type.to_string(),
        version: version.to_string(),
        files,
        published: false,
    })
}

/// Parse the text of the PDR called `pdr_name`
///
/// Fails with [`GranaryError::PdrParse`] naming the PDR when the document is
/// not well-formed ODL, a required parameter is missing or the file count
/// does not match `TOTAL_FILE_COUNT`.
pub fn parse_pdr(pdr_name: &str, text: &str) -> Result<ParsedPdr> {
    let invalid = |reason: String| GranaryError::PdrParse { pdr: pdr_name.to_string(), reason };

    let document = parse_odl(text).map_err(invalid)?;
    let granules = document
        .objects("FILE_GROUP")
        .map(parse_file_group)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(invalid)?;
    if granules.is_empty() {
        return Err(invalid("no FILE_GROUP objects".into()));
    }

    let files_count = granules.iter().map(|g| g.files.len()).sum();
    if let Some(declared) = document.get("TOTAL_FILE_COUNT") {
        if declared.parse::<usize>().ok() != Some(files_count) {
            return Err(invalid(format!(
                "TOTAL_FILE_COUNT = {} but {} FILE_SPEC objects found",
                declared, files_count
            )));
        }
    }
    let total_size = granules
        .iter()
        .flat_map(|g| &g.files)
        .filter_map(|f| f.size)
        .sum();

    Ok(ParsedPdr {
        granules_count: granules.len(),
        granules,
        files_count,
        total_size,
    })
}
