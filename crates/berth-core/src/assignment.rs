//! Assignments and the installations built from them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::artifact::{BinaryCoordinate, ConfigCoordinate};

/// The software a slot should run: one binary plus one config bundle.
///
/// User-supplied assignments may be partial (no group). The coordinator
/// replaces them with fully qualified ones before shipping an
/// [`Installation`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub binary: BinaryCoordinate,
    pub config: ConfigCoordinate,
}

impl Assignment {
    pub fn new(binary: BinaryCoordinate, config: ConfigCoordinate) -> Self {
        Self { binary, config }
    }

    /// Parse both coordinates from their textual forms.
    pub fn parse(binary: &str, config: &str) -> anyhow::Result<Self> {
        Ok(Self {
            binary: binary.parse()?,
            config: config.parse()?,
        })
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.binary, self.config)
    }
}

/// Everything an agent needs to materialize a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    /// The resolved assignment.
    pub assignment: Assignment,
    /// Where to download the binary archive from.
    pub binary_file: Url,
    /// Config file path (relative to the deployment root) to fetch location.
    pub config_files: BTreeMap<String, Url>,
    /// Named resources the deployment claims on its agent.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
}

/// Version overrides applied by an upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeVersions {
    pub binary_version: Option<String>,
    pub config_version: Option<String>,
}

impl UpgradeVersions {
    pub fn new(binary_version: Option<String>, config_version: Option<String>) -> Self {
        Self {
            binary_version,
            config_version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.binary_version.is_none() && self.config_version.is_none()
    }

    /// Assignment with the requested versions swapped in, still unresolved.
    pub fn upgrade(&self, assignment: &Assignment) -> Assignment {
        let binary = match &self.binary_version {
            Some(version) => assignment.binary.with_version(version),
            None => assignment.binary.clone(),
        };
        let config = match &self.config_version {
            Some(version) => assignment.config.with_version(version),
            None => assignment.config.clone(),
        };
        Assignment { binary, config }
    }
}
