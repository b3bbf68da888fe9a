//! `berth.toml` configuration.
//!
//! ```toml
//! [agent]
//! slots_dir = "/var/lib/berth/slots"
//! max_lock_wait_ms = 1000
//! resources = { cpu = 8, memory = 1024 }
//!
//! [repository]
//! default_group_ids = ["fruit"]
//! bases = ["file:///srv/repo/"]
//!
//! [coordinator]
//! environment = "local"
//! ```

pub mod parser;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

pub use parser::{load_config, parse_berth_toml, parse_berth_toml_str};

/// Root of `berth.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub agent: AgentConfig,
    pub repository: RepositoryConfig,
    pub coordinator: CoordinatorConfig,
}

impl BerthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.agent.validate()?;
        self.repository.validate()?;
        self.coordinator.validate()?;
        Ok(())
    }
}

/// `[agent]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding one sub-directory per slot.
    pub slots_dir: PathBuf,
    /// Upper bound on waiting for a slot's lock.
    pub max_lock_wait_ms: u64,
    /// Capacity advertised to the coordinator.
    pub resources: BTreeMap<String, u64>,
    pub location: Option<String>,
    pub instance_type: Option<String>,
    /// Address the coordinator reaches this agent on.
    pub internal_uri: Option<Url>,
    /// Address clients outside the fleet use; may differ behind NAT.
    pub external_uri: Option<Url>,
    /// Coordinator to announce to; no announcements when unset.
    pub coordinator_uri: Option<Url>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            slots_dir: default_slots_dir(),
            max_lock_wait_ms: 1000,
            resources: BTreeMap::new(),
            location: None,
            instance_type: None,
            internal_uri: None,
            external_uri: None,
            coordinator_uri: None,
        }
    }
}

impl AgentConfig {
    /// Config rooted at `slots_dir` with defaults everywhere else.
    pub fn with_slots_dir(slots_dir: impl Into<PathBuf>) -> Self {
        Self {
            slots_dir: slots_dir.into(),
            ..Self::default()
        }
    }

    pub fn max_lock_wait(&self) -> Duration {
        Duration::from_millis(self.max_lock_wait_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_lock_wait_ms == 0 {
            anyhow::bail!("agent.max_lock_wait_ms must be greater than zero");
        }
        if self.slots_dir.as_os_str().is_empty() {
            anyhow::bail!("agent.slots_dir must not be empty");
        }
        Ok(())
    }
}

/// `[repository]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Groups tried, in order, for coordinates without one.
    pub default_group_ids: Vec<String>,
    /// Repository bases probed in order.
    pub bases: Vec<Url>,
    pub request_timeout_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_group_ids: Vec::new(),
            bases: Vec::new(),
            request_timeout_ms: 5000,
        }
    }
}

impl RepositoryConfig {
    fn validate(&self) -> anyhow::Result<()> {
        for base in &self.bases {
            if !matches!(base.scheme(), "file" | "http" | "https") {
                anyhow::bail!(
                    "repository.bases: unsupported scheme '{}' in {}",
                    base.scheme(),
                    base
                );
            }
        }
        if self.default_group_ids.iter().any(|g| g.trim().is_empty()) {
            anyhow::bail!("repository.default_group_ids must not contain empty entries");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("repository.request_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

/// `[coordinator]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Environment name reported in service descriptors.
    pub environment: String,
    pub announce_interval_ms: u64,
    /// Timeout for calls to remote agents.
    pub agent_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            environment: "local".to_string(),
            announce_interval_ms: 3000,
            agent_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.environment.trim().is_empty() {
            anyhow::bail!("coordinator.environment must not be empty");
        }
        if self.announce_interval_ms == 0 {
            anyhow::bail!("coordinator.announce_interval_ms must be greater than zero");
        }
        Ok(())
    }
}

/// `<data dir>/berth/slots`, or `./berth/slots` when no data dir exists.
pub fn default_slots_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("berth")
        .join("slots")
}
