//! Maven-layout repository resolution.
//!
//! Turns partial coordinates into [`ResolvedCoordinate`]s by probing an
//! ordered list of repository bases:
//!
//! ```text
//! <base>/<group with . as />/<artifact>/<version>/<artifact>-<fileVersion>[-<classifier>].<packaging>
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use url::Url;

use super::coordinate::{
    BinaryCoordinate, ConfigCoordinate, Coordinate, ResolvedCoordinate,
};
use super::fetch::Fetcher;
use crate::assignment::{Assignment, Installation};
use crate::config::RepositoryConfig;
use crate::error::BerthError;

/// Config file carrying the resource requirements of an installation.
pub const RESOURCES_FILE: &str = "berth-resources.properties";

/// `<base>-<yyyyMMdd>.<HHmmss>-<build>`: a snapshot file version.
static TIMESTAMP_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)-[0-9]{8}\.[0-9]{6}-[0-9]+$").expect("timestamp pattern is valid")
});

static SNAPSHOT_VERSION_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<snapshotVersion>(.*?)</snapshotVersion>").expect("pattern is valid")
});

static LEGACY_SNAPSHOT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<snapshot>.*?<timestamp>\s*([0-9.]+)\s*</timestamp>.*?<buildNumber>\s*([0-9]+)\s*</buildNumber>",
    )
    .expect("pattern is valid")
});

/// Artifact repository made of one or more bases sharing a layout.
#[derive(Debug, Clone)]
pub struct Repository {
    default_group_ids: Vec<String>,
    bases: Vec<Url>,
    fetcher: Arc<Fetcher>,
}

impl Repository {
    /// Create a new Repository.
    ///
    /// Bases get a trailing `/` so joins keep their last path segment.
    pub fn new(
        default_group_ids: Vec<String>,
        bases: Vec<Url>,
        fetcher: Arc<Fetcher>,
    ) -> Self {
        let bases = bases
            .into_iter()
            .map(|mut base| {
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                base
            })
            .collect();
        Self {
            default_group_ids,
            bases,
            fetcher,
        }
    }

    /// Build a repository (and its fetcher) from the `[repository]` table.
    pub fn from_config(config: &RepositoryConfig) -> anyhow::Result<Self> {
        let fetcher = Fetcher::new(Duration::from_millis(config.request_timeout_ms))?;
        Ok(Self::new(
            config.default_group_ids.clone(),
            config.bases.clone(),
            Arc::new(fetcher),
        ))
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn bases(&self) -> &[Url] {
        &self.bases
    }

    /// Resolve a binary coordinate.
    pub fn resolve(&self, binary: &BinaryCoordinate) -> anyhow::Result<ResolvedCoordinate> {
        self.resolve_coordinate(binary.coordinate(), &binary.to_string())
    }

    /// Resolve a config coordinate.
    pub fn resolve_config(&self, config: &ConfigCoordinate) -> anyhow::Result<ResolvedCoordinate> {
        self.resolve_coordinate(config.coordinate(), &config.to_string())
    }

    /// Resolve `current` moved to another version.
    pub fn binary_upgrade(
        &self,
        current: &BinaryCoordinate,
        version: &str,
    ) -> anyhow::Result<ResolvedCoordinate> {
        self.resolve(&current.with_version(version))
    }

    pub fn config_upgrade(
        &self,
        current: &ConfigCoordinate,
        version: &str,
    ) -> anyhow::Result<ResolvedCoordinate> {
        self.resolve_config(&current.with_version(version))
    }

    /// List the files of a resolved config bundle.
    ///
    /// The config artifact is a text index with one relative path per line
    /// (blank lines and `#` comments ignored). Each path is fetched from the
    /// same version directory as the index.
    pub fn config_files(
        &self,
        config: &ResolvedCoordinate,
    ) -> anyhow::Result<BTreeMap<String, Url>> {
        let index = self
            .fetcher
            .read_to_string(config.uri())
            .with_context(|| format!("Failed to read config index {}", config.uri()))?;

        let mut files = BTreeMap::new();
        for line in index.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('/') || line.split('/').any(|part| part == ".." || part.is_empty()) {
                anyhow::bail!(
                    "Config index {} lists an invalid path: {}",
                    config.uri(),
                    line
                );
            }
            let uri = config
                .uri()
                .join(line)
                .with_context(|| format!("Invalid config path {}", line))?;
            files.insert(line.to_string(), uri);
        }
        Ok(files)
    }

    /// Read resource requirements from the config bundle, if it has any.
    pub fn resources(
        &self,
        config_files: &BTreeMap<String, Url>,
    ) -> anyhow::Result<BTreeMap<String, u64>> {
        let Some(uri) = config_files.get(RESOURCES_FILE) else {
            return Ok(BTreeMap::new());
        };
        let text = self.fetcher.read_to_string(uri)?;
        parse_resources(&text).with_context(|| format!("Invalid resources file {}", uri))
    }

    /// Resolve an assignment and gather everything needed to install it.
    pub fn installation(&self, assignment: &Assignment) -> anyhow::Result<Installation> {
        let binary = self.resolve(&assignment.binary)?;
        let config = self.resolve_config(&assignment.config)?;
        let config_files = self.config_files(&config)?;
        let resources = self.resources(&config_files)?;

        Ok(Installation {
            assignment: Assignment::new(binary.to_binary(), config.to_config()),
            binary_file: binary.uri().clone(),
            config_files,
            resources,
        })
    }

    fn resolve_coordinate(
        &self,
        coordinate: &Coordinate,
        display: &str,
    ) -> anyhow::Result<ResolvedCoordinate> {
        let groups: Vec<&str> = match coordinate.group() {
            Some(group) => vec![group],
            None => self.default_group_ids.iter().map(String::as_str).collect(),
        };

        let mut matches = Vec::new();
        for group in groups {
            if let Some(resolved) = self.locate(&coordinate.with_group(group)) {
                matches.push(resolved);
            }
        }

        match matches.len() {
            0 => Err(BerthError::ArtifactNotFound {
                coordinate: display.to_string(),
                searched: self.bases.iter().map(Url::to_string).collect(),
            }
            .into()),
            1 => Ok(matches.remove(0)),
            _ => Err(BerthError::AmbiguousArtifact {
                coordinate: display.to_string(),
                matches: matches.iter().map(|m| m.to_binary().to_string()).collect(),
            }
            .into()),
        }
    }

    /// Find a coordinate whose group is already set.
    fn locate(&self, coordinate: &Coordinate) -> Option<ResolvedCoordinate> {
        let version = coordinate.version();

        if let Some(uri) = self.probe(coordinate, version, version) {
            return Some(ResolvedCoordinate::new(
                coordinate.clone(),
                version.to_string(),
                uri,
            ));
        }

        if version.ends_with("-SNAPSHOT") {
            for file_version in self.snapshot_file_versions(coordinate) {
                if let Some(uri) = self.probe(coordinate, version, &file_version) {
                    return Some(ResolvedCoordinate::new(coordinate.clone(), file_version, uri));
                }
            }
        }

        if let Some(captures) = TIMESTAMP_VERSION.captures(version) {
            let snapshot = format!("{}-SNAPSHOT", &captures[1]);
            if let Some(uri) = self.probe(coordinate, &snapshot, version) {
                return Some(ResolvedCoordinate::new(
                    coordinate.with_version(&snapshot),
                    version.to_string(),
                    uri,
                ));
            }
        }

        None
    }

    /// First base serving the artifact at `version`/`file_version`.
    fn probe(&self, coordinate: &Coordinate, version: &str, file_version: &str) -> Option<Url> {
        let path = artifact_path(coordinate, version, file_version);
        self.bases.iter().find_map(|base| {
            let uri = base.join(&path).ok()?;
            tracing::debug!("probing {}", uri);
            self.fetcher.is_valid_binary(&uri).then_some(uri)
        })
    }

    /// Timestamped file versions advertised by `maven-metadata.xml`, in base order.
    fn snapshot_file_versions(&self, coordinate: &Coordinate) -> Vec<String> {
        let path = format!("{}maven-metadata.xml", version_dir(coordinate, coordinate.version()));
        self.bases
            .iter()
            .filter_map(|base| {
                let uri = base.join(&path).ok()?;
                let xml = match self.fetcher.read_to_string(&uri) {
                    Ok(xml) => xml,
                    Err(e) => {
                        tracing::debug!("no snapshot metadata at {}: {:#}", uri, e);
                        return None;
                    }
                };
                snapshot_file_version(&xml, coordinate)
            })
            .collect()
    }
}

/// Relative path of an artifact file under a repository base.
fn artifact_path(coordinate: &Coordinate, version: &str, file_version: &str) -> String {
    let mut path = version_dir(coordinate, version);
    path.push_str(coordinate.artifact());
    path.push('-');
    path.push_str(file_version);
    if let Some(classifier) = coordinate.classifier() {
        path.push('-');
        path.push_str(classifier);
    }
    path.push('.');
    path.push_str(coordinate.packaging());
    path
}

fn version_dir(coordinate: &Coordinate, version: &str) -> String {
    format!(
        "{}/{}/{}/",
        coordinate.group().unwrap_or_default().replace('.', "/"),
        coordinate.artifact(),
        version
    )
}

/// Pick the timestamped file version matching packaging and classifier.
fn snapshot_file_version(xml: &str, coordinate: &Coordinate) -> Option<String> {
    let tag = |block: &str, name: &str| -> Option<String> {
        let pattern = format!(r"<{name}>\s*([^<]*?)\s*</{name}>");
        Regex::new(&pattern)
            .ok()?
            .captures(block)
            .map(|c| c[1].to_string())
    };

    let from_list = SNAPSHOT_VERSION_BLOCK
        .captures_iter(xml)
        .filter(|block| {
            let block = &block[1];
            tag(block, "extension").as_deref() == Some(coordinate.packaging())
                && tag(block, "classifier").as_deref() == coordinate.classifier()
        })
        .filter_map(|block| tag(&block[1], "value"))
        .last();
    if from_list.is_some() {
        return from_list;
    }

    // Older metadata only records the latest timestamp and build number.
    let captures = LEGACY_SNAPSHOT.captures(xml)?;
    let base = coordinate.version().strip_suffix("-SNAPSHOT")?;
    Some(format!("{}-{}-{}", base, &captures[1], &captures[2]))
}

/// Parse `name=integer` lines.
fn parse_resources(text: &str) -> anyhow::Result<BTreeMap<String, u64>> {
    let mut resources = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (name, value) = line
            .split_once('=')
            .or_else(|| line.split_once(':'))
            .with_context(|| format!("line {}: expected name=value", idx + 1))?;
        let value: u64 = value
            .trim()
            .parse()
            .with_context(|| format!("line {}: '{}' is not a whole number", idx + 1, value.trim()))?;
        resources.insert(name.trim().to_string(), value);
    }
    Ok(resources)
}
