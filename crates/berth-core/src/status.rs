//! Status snapshots for slots and agents.
//!
//! Every layer (slot, agent, remote proxy, coordinator) reports state with
//! these same types, so a status read on the coordinator has the shape of
//! one read directly on the agent.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::assignment::Assignment;

// =============================================================================
// Lifecycle states
// =============================================================================

/// Lifecycle of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotLifecycleState {
    Unassigned,
    Stopped,
    Running,
    Restarting,
    Terminated,
    Unknown,
}

impl SlotLifecycleState {
    pub const ALL: [SlotLifecycleState; 6] = [
        Self::Unassigned,
        Self::Stopped,
        Self::Running,
        Self::Restarting,
        Self::Terminated,
        Self::Unknown,
    ];

    /// One-letter code used by state filters.
    pub fn code(self) -> char {
        match self {
            Self::Unassigned => 'u',
            Self::Stopped => 's',
            Self::Running => 'r',
            Self::Restarting => 'R',
            Self::Terminated => 't',
            Self::Unknown => '?',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SlotLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an agent as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentLifecycleState {
    Online,
    Offline,
    Provisioning,
}

impl AgentLifecycleState {
    /// One-letter code used by agent state filters.
    pub fn code(self) -> char {
        match self {
            Self::Online => 'o',
            Self::Offline => 'x',
            Self::Provisioning => 'p',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        [Self::Online, Self::Offline, Self::Provisioning]
            .into_iter()
            .find(|state| state.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Provisioning => "provisioning",
        }
    }
}

impl fmt::Display for AgentLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Slot status
// =============================================================================

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub id: Uuid,
    pub name: String,
    /// Agent-relative path, `/<name>`.
    pub path: String,
    pub assignment: Option<Assignment>,
    pub state: SlotLifecycleState,
    /// Resources held while assigned.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
    /// Tree hash of the deployment recorded at install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_hash: Option<String>,
}

impl SlotStatus {
    /// Structural status of an empty slot.
    pub fn unassigned(id: Uuid, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            path: format!("/{}", name),
            assignment: None,
            state: SlotLifecycleState::Unassigned,
            resources: BTreeMap::new(),
            installed_hash: None,
        }
    }

    pub fn terminated(id: Uuid, name: &str) -> Self {
        Self {
            state: SlotLifecycleState::Terminated,
            ..Self::unassigned(id, name)
        }
    }

    pub fn with_state(&self, state: SlotLifecycleState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Fingerprint of this slot alone.
    pub fn version(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        self.update_fingerprint(&mut hasher);
        hasher.finalize().to_hex().to_string()
    }

    /// Feed the fields that matter for optimistic concurrency.
    pub(crate) fn update_fingerprint(&self, hasher: &mut blake3::Hasher) {
        hasher.update(self.id.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(self.state.as_str().as_bytes());
        hasher.update(&[0x00]);
        if let Some(assignment) = &self.assignment {
            hasher.update(assignment.to_string().as_bytes());
        }
        hasher.update(&[0xFF]);
    }
}

// =============================================================================
// Agent status
// =============================================================================

/// Snapshot of one agent and every slot it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentLifecycleState,
    pub internal_uri: Option<Url>,
    pub external_uri: Option<Url>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub instance_type: Option<String>,
    /// Total capacity per named resource.
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
    #[serde(default)]
    pub slots: Vec<SlotStatus>,
}

impl AgentStatus {
    pub fn slot(&self, name: &str) -> Option<&SlotStatus> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    pub fn slot_by_id(&self, id: Uuid) -> Option<&SlotStatus> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    /// Hostname of the external (or internal) URI, if known.
    pub fn host(&self) -> Option<&str> {
        self.external_uri
            .as_ref()
            .or(self.internal_uri.as_ref())
            .and_then(|uri| uri.host_str())
    }

    /// Capacity minus resources held by assigned slots.
    pub fn available_resources(&self) -> BTreeMap<String, u64> {
        let mut available = self.resources.clone();
        for slot in self.slots.iter().filter(|s| s.assignment.is_some()) {
            for (name, amount) in &slot.resources {
                if let Some(left) = available.get_mut(name) {
                    *left = left.saturating_sub(*amount);
                }
            }
        }
        available
    }

    pub fn with_state(&self, state: AgentLifecycleState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Status after a failed probe: offline with every slot unknown.
    pub fn offline(&self) -> Self {
        Self {
            state: AgentLifecycleState::Offline,
            slots: self
                .slots
                .iter()
                .map(|slot| slot.with_state(SlotLifecycleState::Unknown))
                .collect(),
            ..self.clone()
        }
    }

    /// Fold a slot status returned by a command into this snapshot.
    ///
    /// Terminated slots are dropped; others replace the entry with the same
    /// id or are appended.
    pub fn with_slot_status(&self, status: SlotStatus) -> Self {
        let mut slots: Vec<SlotStatus> = self
            .slots
            .iter()
            .filter(|slot| slot.id != status.id)
            .cloned()
            .collect();
        if status.state != SlotLifecycleState::Terminated {
            slots.push(status);
        }
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            slots,
            ..self.clone()
        }
    }
}
