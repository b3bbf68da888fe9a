//! Per-slot deployments on disk.

pub mod archive;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::assignment::{Assignment, Installation};

pub use store::DeploymentStore;

/// Identifier of a deployment within its slot, `deployment<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentId(u32);

impl DeploymentId {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deployment{}", self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s
            .strip_prefix("deployment")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("Invalid deployment id: {}", s))?;
        Ok(Self(number))
    }
}

impl Serialize for DeploymentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeploymentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One materialized installation inside a slot.
///
/// This is also the on-disk descriptor format; the directory is not
/// serialized since it always sits next to the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub assignment: Assignment,
    pub installation: Installation,
    pub installed_at: DateTime<Utc>,
    /// Tree hash of the directory right after install.
    pub tree_hash: String,
    #[serde(skip)]
    dir: PathBuf,
}

impl Deployment {
    pub(crate) fn new(
        id: DeploymentId,
        dir: PathBuf,
        installation: &Installation,
        tree_hash: String,
    ) -> Self {
        Self {
            id,
            assignment: installation.assignment.clone(),
            installation: installation.clone(),
            installed_at: Utc::now(),
            tree_hash,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn set_dir(&mut self, dir: PathBuf) {
        self.dir = dir;
    }
}
