//! Regex-driven recursive directory listing
//!
//! A path specification mixes literal directory names with parenthesized
//! regular expressions, e.g. `/data/(2019|2020)/(granule_.*)`. The walk only
//! descends into directories that satisfy the specification, so providers with
//! huge flat directories are listed once per matching level instead of being
//! traversed in full.
//!
//! Once the specification is exhausted every deeper directory is listed
//! unfiltered, which makes a plain literal path behave like a recursive listing
//! of that directory.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use granary_common::types::{compile_regex, FileDescriptor, ListEntry};
use granary_common::Result;
use regex::Regex;
use tracing::{debug, instrument};

/// Single-level directory listing, implemented by hierarchical providers
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list_directory(&self, path: &str) -> Result<Vec<ListEntry>>;
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Pattern(Regex),
}

/// Parsed path specification
#[derive(Debug)]
pub struct PathSpec {
    start: String,
    segments: Vec<Segment>,
}

impl PathSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let absolute = spec.starts_with('/');
        let components = split_components(spec);

        let leading = components.iter().take_while(|c| !c.contains('(')).count();
        let (literals, rest) = components.split_at(leading);

        let root = if absolute { "/" } else { "." };
        let start = literals
            .iter()
            .fold(root.to_string(), |path, literal| join_path(&path, literal));

        let segments = rest
            .iter()
            .map(|component| {
                if component.contains('(') {
                    compile_regex(component).map(Segment::Pattern)
                } else {
                    Ok(Segment::Literal(component.to_string()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { start, segments })
    }

    /// Directory the walk starts from
    pub fn start(&self) -> &str {
        &self.start
    }
}

/// Split on `/` outside parentheses, dropping empty components
fn split_components(spec: &str) -> Vec<&str> {
    let mut components = Vec::new();
    let mut depth = 0usize;
    let mut begin = 0usize;

    for (idx, ch) in spec.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => {
                components.push(&spec[begin..idx]);
                begin = idx + 1;
            },
            _ => {},
        }
    }
    components.push(&spec[begin..]);

    components.into_iter().filter(|c| !c.is_empty()).collect()
}

/// Join a listed directory with a child name
pub fn join_path(dir: &str, name: &str) -> String {
    match dir {
        "." | "" => name.to_string(),
        "/" => format!("/{}", name),
        _ => format!("{}/{}", dir.trim_end_matches('/'), name),
    }
}

/// List every file reachable through directories that satisfy `spec`
#[instrument(skip(lister))]
pub async fn list_recursive(lister: &dyn DirectoryLister, spec: &str) -> Result<Vec<FileDescriptor>> {
    let spec = PathSpec::parse(spec)?;
    let files = walk(lister, &spec.segments, spec.start.clone(), 0).await?;
    debug!(count = files.len(), "Recursive listing complete");
    Ok(files)
}

fn walk<'a>(
    lister: &'a dyn DirectoryLister,
    segments: &'a [Segment],
    path: String,
    position: usize,
) -> BoxFuture<'a, Result<Vec<FileDescriptor>>> {
    async move {
        if let Some(Segment::Literal(literal)) = segments.get(position) {
            return walk(lister, segments, join_path(&path, literal), position + 1).await;
        }

        let pattern = match segments.get(position) {
            Some(Segment::Pattern(regex)) => Some(regex),
            _ => None,
        };
        let last = position + 1 >= segments.len();

        let entries = lister.list_directory(&path).await?;
        let mut files = Vec::new();

        for entry in entries {
            let matches = pattern.map(|re| re.is_match(&entry.name)).unwrap_or(true);
            if !matches {
                continue;
            }

            if entry.is_directory() {
                let child = join_path(&path, &entry.name);
                files.extend(walk(lister, segments, child, position + 1).await?);
            } else if pattern.is_none() || last {
                files.push(FileDescriptor {
                    name: entry.name,
                    path: Some(path.clone()),
                    size: entry.size,
                    time: entry.time,
                });
            }
        }

        Ok(files)
    }
    .boxed()
}
