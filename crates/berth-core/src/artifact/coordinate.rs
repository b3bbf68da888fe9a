//! Artifact coordinate types.
//!
//! Binary coordinates use the textual form
//! `group:artifact[:packaging[:classifier]]:version`, or the short form
//! `artifact:version` which leaves the group to the resolver's defaults.
//!
//! Config coordinates start with `@`:
//! - `@component:version`
//! - `@environment:component:version`
//! - `@group:environment:component:version` (environment may be empty)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::BerthError;

/// Packaging used when a binary coordinate does not name one.
pub const DEFAULT_PACKAGING: &str = "tar.gz";

/// Packaging of every config artifact.
pub const CONFIG_PACKAGING: &str = "config";

/// Fields shared by binary and config coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    group: Option<String>,
    artifact: String,
    version: String,
    packaging: String,
    classifier: Option<String>,
}

impl Coordinate {
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn packaging(&self) -> &str {
        &self.packaging
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    /// Same coordinate with an explicit group.
    pub(crate) fn with_group(&self, group: &str) -> Self {
        Self {
            group: Some(group.to_string()),
            ..self.clone()
        }
    }

    pub(crate) fn with_version(&self, version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..self.clone()
        }
    }
}

/// Identity of a binary archive, possibly missing its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinaryCoordinate(Coordinate);

impl BinaryCoordinate {
    pub fn coordinate(&self) -> &Coordinate {
        &self.0
    }

    /// Same binary at another version.
    pub fn with_version(&self, version: &str) -> Self {
        Self(self.0.with_version(version))
    }
}

impl FromStr for BinaryCoordinate {
    type Err = BerthError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts = split_parts(input)?;
        let owned = |s: &str| s.to_string();
        let coordinate = match parts.as_slice() {
            [artifact, version] => Coordinate {
                group: None,
                artifact: owned(artifact),
                version: owned(version),
                packaging: DEFAULT_PACKAGING.to_string(),
                classifier: None,
            },
            [group, artifact, version] => Coordinate {
                group: Some(owned(group)),
                artifact: owned(artifact),
                version: owned(version),
                packaging: DEFAULT_PACKAGING.to_string(),
                classifier: None,
            },
            [group, artifact, packaging, version] => Coordinate {
                group: Some(owned(group)),
                artifact: owned(artifact),
                version: owned(version),
                packaging: owned(packaging),
                classifier: None,
            },
            [group, artifact, packaging, classifier, version] => Coordinate {
                group: Some(owned(group)),
                artifact: owned(artifact),
                version: owned(version),
                packaging: owned(packaging),
                classifier: Some(owned(classifier)),
            },
            _ => {
                return Err(invalid(
                    input,
                    "expected group:artifact[:packaging[:classifier]]:version",
                ));
            }
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid(input, "empty component"));
        }
        Ok(Self(coordinate))
    }
}

impl fmt::Display for BinaryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.0;
        let Some(group) = &c.group else {
            return write!(f, "{}:{}", c.artifact, c.version);
        };
        write!(f, "{}:{}", group, c.artifact)?;
        if c.packaging != DEFAULT_PACKAGING || c.classifier.is_some() {
            write!(f, ":{}", c.packaging)?;
        }
        if let Some(classifier) = &c.classifier {
            write!(f, ":{}", classifier)?;
        }
        write!(f, ":{}", c.version)
    }
}

/// Identity of a config bundle, possibly missing its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigCoordinate(Coordinate);

impl ConfigCoordinate {
    pub fn coordinate(&self) -> &Coordinate {
        &self.0
    }

    /// Component name (the artifact id).
    pub fn component(&self) -> &str {
        &self.0.artifact
    }

    /// Environment (the classifier), if any.
    pub fn environment(&self) -> Option<&str> {
        self.0.classifier.as_deref()
    }

    pub fn with_version(&self, version: &str) -> Self {
        Self(self.0.with_version(version))
    }
}

impl FromStr for ConfigCoordinate {
    type Err = BerthError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let body = input
            .strip_prefix('@')
            .ok_or_else(|| invalid(input, "config coordinates start with '@'"))?;
        let parts = split_parts(body).map_err(|_| invalid(input, "empty coordinate"))?;
        let owned = |s: &str| s.to_string();
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let (group, environment, component, version) = match parts.as_slice() {
            [component, version] => (None, None, *component, *version),
            [environment, component, version] => {
                (None, Some(owned(environment)), *component, *version)
            }
            [group, environment, component, version] => {
                (Some(owned(group)), non_empty(environment), *component, *version)
            }
            _ => {
                return Err(invalid(
                    input,
                    "expected @[[group:]environment:]component:version",
                ));
            }
        };
        let required_empty = group.as_deref() == Some("")
            || environment.as_deref() == Some("")
            || component.is_empty()
            || version.is_empty();
        if required_empty {
            return Err(invalid(input, "empty component"));
        }
        Ok(Self(Coordinate {
            group,
            artifact: component.to_string(),
            version: version.to_string(),
            packaging: CONFIG_PACKAGING.to_string(),
            classifier: environment,
        }))
    }
}

impl fmt::Display for ConfigCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.0;
        match (&c.group, &c.classifier) {
            (Some(group), environment) => write!(
                f,
                "@{}:{}:{}:{}",
                group,
                environment.as_deref().unwrap_or(""),
                c.artifact,
                c.version
            ),
            (None, Some(environment)) => {
                write!(f, "@{}:{}:{}", environment, c.artifact, c.version)
            }
            (None, None) => write!(f, "@{}:{}", c.artifact, c.version),
        }
    }
}

/// A coordinate with every field concrete and a fetch location.
///
/// Only the resolver creates these; consumers never resolve them again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedCoordinate {
    coordinate: Coordinate,
    group: String,
    file_version: String,
    uri: Url,
}

impl ResolvedCoordinate {
    pub(crate) fn new(coordinate: Coordinate, file_version: String, uri: Url) -> Self {
        let group = coordinate.group.clone().unwrap_or_default();
        Self {
            coordinate,
            group,
            file_version,
            uri,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn artifact(&self) -> &str {
        &self.coordinate.artifact
    }

    /// Repository directory version (`1.0-SNAPSHOT` for snapshots).
    pub fn version(&self) -> &str {
        &self.coordinate.version
    }

    /// Version embedded in the file name (timestamped for snapshots).
    pub fn file_version(&self) -> &str {
        &self.file_version
    }

    pub fn packaging(&self) -> &str {
        &self.coordinate.packaging
    }

    pub fn classifier(&self) -> Option<&str> {
        self.coordinate.classifier.as_deref()
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Fully qualified binary coordinate pinned to the file version.
    pub fn to_binary(&self) -> BinaryCoordinate {
        BinaryCoordinate(self.pinned())
    }

    /// Fully qualified config coordinate pinned to the file version.
    pub fn to_config(&self) -> ConfigCoordinate {
        ConfigCoordinate(self.pinned())
    }

    fn pinned(&self) -> Coordinate {
        Coordinate {
            group: Some(self.group.clone()),
            version: self.file_version.clone(),
            ..self.coordinate.clone()
        }
    }
}

impl fmt::Display for ResolvedCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", BinaryCoordinate(self.pinned()), self.uri)
    }
}

fn split_parts(input: &str) -> Result<Vec<&str>, BerthError> {
    if input.trim().is_empty() {
        return Err(invalid(input, "empty coordinate"));
    }
    Ok(input.split(':').collect())
}

fn invalid(input: &str, reason: &str) -> BerthError {
    BerthError::InvalidCoordinate {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(BinaryCoordinate);
string_serde!(ConfigCoordinate);
